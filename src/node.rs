//! Node wiring: builds a transport and a file server and connects the two.

use std::sync::{Arc, Weak};

use crate::config::NodeConfig;
use crate::server::service::FileServer;
use crate::server::types::FileServerOpts;
use crate::transport::peer::Peer;
use crate::transport::tcp::{TcpTransport, TcpTransportOpts};

/// Creates a file server listening on `listen_addr` (port 0 picks a free port).
///
/// The transport's `on_peer` hook holds only a weak reference, so dropping the server
/// makes later connections fail registration instead of keeping it alive.
pub fn make_server(listen_addr: &str, opts: FileServerOpts) -> Arc<FileServer> {
    let transport = TcpTransport::new(TcpTransportOpts::new(listen_addr));
    let server = FileServer::new(opts, transport.clone());

    let weak: Weak<FileServer> = Arc::downgrade(&server);
    transport.set_on_peer(Arc::new(move |peer: Arc<Peer>| -> anyhow::Result<()> {
        match weak.upgrade() {
            Some(server) => server.on_peer(peer),
            None => anyhow::bail!("file server is gone"),
        }
    }));

    server
}

/// [`make_server`] from a loaded configuration.
pub fn from_config(config: NodeConfig) -> anyhow::Result<Arc<FileServer>> {
    let listen_addr = config.listen_addr.clone();
    let opts = config.into_opts()?;
    Ok(make_server(&listen_addr, opts))
}
