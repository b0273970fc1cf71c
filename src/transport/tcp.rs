use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use super::codec::{Decoder, DefaultDecoder};
use super::peer::{ConnReader, Peer};
use super::types::{
    HandshakeFn, OnPeerFn, RPC_QUEUE_DEPTH, Rpc, TransportError, nop_handshake,
};

pub struct TcpTransportOpts {
    /// Address to listen on, e.g. `127.0.0.1:3000` (port 0 picks a free one).
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub decoder: Arc<dyn Decoder>,
}

impl TcpTransportOpts {
    /// No-op handshake and the production decoder.
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            decoder: Arc::new(DefaultDecoder),
        }
    }
}

/// TCP implementation of the connection transport.
///
/// Every accepted or dialed socket gets its own framing task; decoded control messages
/// from all of them land on one queue, handed out once through [`TcpTransport::consume`].
pub struct TcpTransport {
    opts: TcpTransportOpts,
    on_peer: OnceLock<OnPeerFn>,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: parking_lot::Mutex<Option<mpsc::Receiver<Rpc>>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_QUEUE_DEPTH);

        Arc::new(Self {
            opts,
            on_peer: OnceLock::new(),
            rpc_tx,
            rpc_rx: parking_lot::Mutex::new(Some(rpc_rx)),
            local_addr: OnceLock::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Installs the peer-registration hook. Only the first call takes effect.
    pub fn set_on_peer(&self, on_peer: OnPeerFn) -> bool {
        self.on_peer.set(on_peer).is_ok()
    }

    /// The bound address once listening, the configured one before.
    pub fn addr(&self) -> String {
        match self.local_addr.get() {
            Some(addr) => addr.to_string(),
            None => self.opts.listen_addr.clone(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Read end of the inbound queue. Can be taken once.
    pub fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError> {
        self.rpc_rx
            .lock()
            .take()
            .ok_or(TransportError::AlreadyConsumed)
    }

    /// Stops accepting and releases the listening socket. Established connections
    /// keep running until their next I/O error.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Binds the listen address and starts the accept loop in the background.
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(&self.opts.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.opts.listen_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        let transport = self.clone();
        tokio::spawn(async move {
            transport.accept_loop(listener).await;
        });

        tracing::info!("TCP transport listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Opens an outbound connection and starts its framing loop.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), TransportError> {
        let conn = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Dial {
                addr: addr.to_string(),
                source,
            })?;

        let transport = self.clone();
        tokio::spawn(async move {
            transport.handle_conn(conn, true).await;
        });

        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Stopped accepting connections on {}", self.addr());
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((conn, remote)) => {
                        tracing::info!("Incoming connection from {}", remote);
                        let transport = self.clone();
                        tokio::spawn(async move {
                            transport.handle_conn(conn, false).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!("TCP accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, conn: TcpStream, outbound: bool) {
        let (peer, reader) = match Peer::new(conn, outbound) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("Failed to set up connection: {}", e);
                return;
            }
        };
        let peer = Arc::new(peer);

        let reason = match self.serve(peer.clone(), reader).await {
            Ok(()) => "inbound queue closed".to_string(),
            Err(e) => e.to_string(),
        };
        tracing::info!("Dropping peer connection {}: {}", peer.addr(), reason);

        if let Err(e) = peer.close().await {
            tracing::debug!("Closing {} failed: {}", peer.addr(), e);
        }
    }

    /// Handshake, registration, then the framing loop. Returns on the first decode error.
    async fn serve(&self, peer: Arc<Peer>, reader: ConnReader) -> Result<(), TransportError> {
        let addr = peer.addr().to_string();

        (self.opts.handshake)(peer.as_ref()).map_err(|e| TransportError::Handshake {
            addr: addr.clone(),
            reason: format!("{:#}", e),
        })?;

        if let Some(on_peer) = self.on_peer.get() {
            on_peer(peer.clone()).map_err(|e| TransportError::Rejected {
                addr: addr.clone(),
                reason: format!("{:#}", e),
            })?;
        }

        let reader = Arc::new(Mutex::new(reader));

        loop {
            let mut guard = reader.clone().lock_owned().await;
            let mut rpc = Rpc::default();
            self.opts.decoder.decode(&mut *guard, &mut rpc).await?;
            rpc.from = addr.clone();

            if rpc.stream {
                tracing::debug!("[{}] incoming stream, waiting...", addr);
                peer.arm_stream_gate(guard).await?;
                tracing::debug!("[{}] stream closed, resuming read loop", addr);
                continue;
            }
            drop(guard);

            if self.rpc_tx.send(rpc).await.is_err() {
                return Ok(());
            }
        }
    }
}
