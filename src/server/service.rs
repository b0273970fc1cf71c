//! File Server Service
//!
//! Orchestrates network-wide store/get/delete on top of the local [`Store`] and the
//! [`TcpTransport`], and runs the central dispatch loop for inbound control messages.
//!
//! ## Responsibilities
//! - **Registration**: `on_peer` puts every connection into the [`PeerRegistry`] before its
//!   framing loop reads the first frame.
//! - **Replication**: `store` pushes the encrypted payload to every peer at once.
//! - **Retrieval**: `get` falls back to asking the network and decrypts answers to disk.
//!   Every `GetFile` is answered, with a zero size when the key is missing. A stream that
//!   arrives after its wait timed out is discarded by whoever held the wait.
//! - **Dispatch**: a single loop handles `StoreFile`, `GetFile` and `DeleteFile` from peers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::io::InspectReader;
use tokio_util::sync::CancellationToken;

use super::protocol::Message;
use super::registry::PeerRegistry;
use super::types::{FileServerOpts, ServerError};
use crate::crypto::cipher::{IV_LEN, encrypt_stream};
use crate::crypto::key::generate_id;
use crate::store::disk::{Store, StoreError};
use crate::transport::fanout::FanOut;
use crate::transport::peer::{Peer, StreamClaim, StreamLease};
use crate::transport::tcp::TcpTransport;
use crate::transport::types::{INCOMING_STREAM, Rpc, TransportError};

/// Encryption adds exactly the IV to every payload.
const CIPHER_OVERHEAD: u64 = IV_LEN as u64;

pub struct FileServer {
    opts: FileServerOpts,
    store: Store,
    transport: Arc<TcpTransport>,
    peers: Arc<PeerRegistry>,
    shutdown: CancellationToken,
}

impl FileServer {
    /// Creates the server. The caller wires the transport's `on_peer` hook to
    /// [`FileServer::on_peer`] (see [`crate::node::make_server`]).
    pub fn new(mut opts: FileServerOpts, transport: Arc<TcpTransport>) -> Arc<Self> {
        if opts.id.is_empty() {
            opts.id = generate_id();
        }
        let store = Store::new(opts.storage_root.clone(), opts.path_transform);

        Arc::new(Self {
            opts,
            store,
            transport,
            peers: Arc::new(PeerRegistry::new()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.opts.id
    }

    /// The node's local disk store.
    pub fn local_store(&self) -> &Store {
        &self.store
    }

    pub fn transport(&self) -> &Arc<TcpTransport> {
        &self.transport
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.snapshot()
    }

    /// Registers a freshly connected peer.
    pub fn on_peer(&self, peer: Arc<Peer>) -> anyhow::Result<()> {
        tracing::info!(
            "[{}] connected with {} peer {}",
            self.transport.addr(),
            if peer.is_outbound() { "outbound" } else { "inbound" },
            peer.addr()
        );
        self.peers.register(peer);
        Ok(())
    }

    /// Listens, dials the bootstrap nodes in the background and starts the dispatch loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, ServerError> {
        let local_addr = self.transport.listen_and_accept().await?;
        let rx = self.transport.consume()?;

        tracing::info!(
            "[{}] starting file server (owner {})",
            local_addr,
            self.opts.id
        );

        self.bootstrap_network();

        let server = self.clone();
        tokio::spawn(async move {
            server.read_loop(rx).await;
        });

        Ok(local_addr)
    }

    /// Stops the dispatch loop and the listener. Open connections drain on their own.
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.transport.close();
    }

    /// Polls until at least `n` peers are registered. Returns `false` on timeout.
    pub async fn wait_for_peers(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.peers.len() < n {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    fn bootstrap_network(&self) {
        for addr in &self.opts.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }

            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                tracing::info!("[{}] attempting to connect with remote {}", transport.addr(), addr);
                if let Err(e) = transport.dial(&addr).await {
                    tracing::warn!("Bootstrap dial failed: {}", e);
                }
            });
        }
    }

    // ============================================================
    // PUBLIC OPERATIONS
    // ============================================================

    /// Stores `reader` locally and replicates it, encrypted, to every peer.
    /// Returns the number of plaintext bytes stored.
    pub async fn store<R>(&self, key: &str, reader: R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut captured = Vec::new();
        let tee = InspectReader::new(reader, |chunk: &[u8]| captured.extend_from_slice(chunk));
        let size = self.store.write(&self.opts.id, key, tee).await?;

        let msg = Message::StoreFile {
            owner_id: self.opts.id.clone(),
            key: key.to_string(),
            size: size + CIPHER_OVERHEAD,
        };
        self.broadcast(&msg).await?;

        tokio::time::sleep(self.opts.settle_interval).await;

        let peers = self.peers.snapshot();
        let mut fanout = FanOut::lock_peers(&peers).await;
        fanout.write_all(&[INCOMING_STREAM]).await?;
        let mut src = captured.as_slice();
        let sent = encrypt_stream(&self.opts.encryption_key, &mut src, &mut fanout).await?;

        tracing::info!(
            "[{}] replicated ({}) bytes to {} peer(s)",
            self.transport.addr(),
            sent,
            fanout.len()
        );
        Ok(size)
    }

    /// Opens the key locally, fetching it from the network first when missing.
    /// Returns the file size and a handle positioned at the start.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        if self.store.exists(&self.opts.id, key).await {
            tracing::info!(
                "[{}] serving file ({}) from local disk",
                self.transport.addr(),
                key
            );
            return Ok(self.store.read(&self.opts.id, key).await?);
        }

        tracing::info!(
            "[{}] don't have file ({}) locally, fetching from network...",
            self.transport.addr(),
            key
        );

        let msg = Message::GetFile {
            owner_id: self.opts.id.clone(),
            key: key.to_string(),
        };
        self.broadcast(&msg).await?;

        tokio::time::sleep(self.opts.settle_interval).await;

        // every peer gets the same deadline; answers are drained in address order
        let deadline = Instant::now() + self.opts.fetch_timeout;
        let peers = self.peers.snapshot();
        let waits: Vec<_> = peers
            .iter()
            .map(|peer| tokio::spawn(wait_for_stream(peer.clone(), deadline)))
            .collect();

        for (peer, wait) in peers.into_iter().zip(waits) {
            let (claim, next) = match wait.await {
                Ok(Ok(waited)) => waited,
                Ok(Err(e)) => {
                    tracing::debug!("No answer for ({}) from {}: {}", key, peer.addr(), e);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Waiting on {} failed: {}", peer.addr(), e);
                    continue;
                }
            };

            let lease = match next {
                Ok(lease) => lease,
                Err(TransportError::StreamTimeout(_)) => {
                    tracing::debug!("No answer for ({}) from {} in time", key, peer.addr());
                    self.discard_late_stream(peer, claim, None);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Waiting on {} failed: {}", peer.addr(), e);
                    continue;
                }
            };
            drop(claim);

            match self.fetch_from(key, lease).await {
                Ok(Some(n)) => tracing::info!(
                    "[{}] received ({}) bytes over the network from {}",
                    self.transport.addr(),
                    n,
                    peer.addr()
                ),
                Ok(None) => tracing::debug!("{} does not have ({})", peer.addr(), key),
                Err(e) => tracing::warn!("Fetching ({}) from {} failed: {}", key, peer.addr(), e),
            }
        }

        Ok(self.store.read(&self.opts.id, key).await?)
    }

    /// Deletes the key locally, then tells every peer to do the same.
    pub async fn delete(&self, key: &str) -> Result<(), ServerError> {
        self.store.delete(&self.opts.id, key).await?;
        tracing::info!("[{}] deleted ({}) locally", self.transport.addr(), key);

        let msg = Message::DeleteFile {
            owner_id: self.opts.id.clone(),
            key: key.to_string(),
        };
        self.broadcast(&msg).await
    }

    /// Sends one control frame to every peer in address order. Stops at the first failure
    /// and drops the failing peer from the registry.
    pub async fn broadcast(&self, msg: &Message) -> Result<(), ServerError> {
        let frame = msg.to_frame()?;

        for peer in self.peers.snapshot() {
            if let Err(source) = peer.send(&frame).await {
                let addr = peer.addr().to_string();
                self.peers.remove(&addr);
                tracing::warn!("Broadcast to {} failed, dropping peer: {}", addr, source);
                return Err(ServerError::Send { addr, source });
            }
        }

        Ok(())
    }

    /// Reads one answer to our `GetFile`: size prefix, then that many encrypted bytes.
    /// A zero size means the peer has no copy.
    async fn fetch_from(
        &self,
        key: &str,
        mut lease: StreamLease,
    ) -> Result<Option<u64>, ServerError> {
        let size = lease.reader().read_u64_le().await?;
        if size == 0 {
            lease.release();
            return Ok(None);
        }

        let result = self.receive_stream(&mut lease, &self.opts.id, key, size).await;
        lease.release();
        result.map(Some)
    }

    /// Takes over a stream we stopped waiting for and throws it away once it arrives, so
    /// it is never mistaken for the answer to a later request. `size` is `None` when the
    /// stream starts with its own size prefix. A peer that stays silent for another
    /// `fetch_timeout` is dropped: its connection can no longer be framed reliably.
    fn discard_late_stream(&self, peer: Arc<Peer>, mut claim: StreamClaim, size: Option<u64>) {
        let peers = self.peers.clone();
        let grace = self.opts.fetch_timeout;

        tokio::spawn(async move {
            let addr = peer.addr().to_string();

            match claim.next_until(Instant::now() + grace).await {
                Ok(mut lease) => {
                    let result = discard_stream(&mut lease, size).await;
                    lease.release();
                    match result {
                        Ok(n) => tracing::debug!("Discarded late stream ({} bytes) from {}", n, addr),
                        Err(e) => tracing::warn!("Discarding late stream from {} failed: {}", addr, e),
                    }
                }
                Err(e) => {
                    tracing::warn!("Dropping peer {}, announced stream never arrived: {}", addr, e);
                    drop(claim);
                    peers.remove(&addr);
                    if let Err(e) = peer.close().await {
                        tracing::debug!("Closing {} failed: {}", addr, e);
                    }
                }
            }
        });
    }

    /// Decrypts exactly `size` bytes from the lease into the store. On failure the rest of
    /// the announced bytes are discarded so the connection stays in sync.
    async fn receive_stream(
        &self,
        lease: &mut StreamLease,
        owner_id: &str,
        key: &str,
        size: u64,
    ) -> Result<u64, ServerError> {
        let mut limited = lease.reader().take(size);
        let result = self
            .store
            .write_decrypted(&self.opts.encryption_key, owner_id, key, &mut limited)
            .await;

        if result.is_err() {
            tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        }
        Ok(result?)
    }

    // ============================================================
    // INBOUND DISPATCH
    // ============================================================

    async fn read_loop(self: Arc<Self>, mut rx: mpsc::Receiver<Rpc>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("[{}] file server stopped due to user quit action", self.transport.addr());
                    break;
                }
                rpc = rx.recv() => {
                    let Some(rpc) = rpc else {
                        break;
                    };
                    if let Err(e) = self.dispatch(&rpc).await {
                        tracing::error!("[{}] handling message from {}: {}", self.transport.addr(), rpc.from, e);
                    }
                }
            }
        }

        self.transport.close();
    }

    async fn dispatch(&self, rpc: &Rpc) -> Result<(), ServerError> {
        let msg = Message::decode(&rpc.payload)?;
        tracing::debug!("[{}] received {:?} from {}", self.transport.addr(), msg, rpc.from);

        match msg {
            Message::StoreFile {
                owner_id,
                key,
                size,
            } => self.handle_store_file(&rpc.from, &owner_id, &key, size).await,
            Message::GetFile { owner_id, key } => {
                self.handle_get_file(&rpc.from, &owner_id, &key).await
            }
            Message::DeleteFile { owner_id, key } => {
                self.handle_delete_file(&rpc.from, &owner_id, &key).await
            }
        }
    }

    fn known_peer(&self, from: &str) -> Result<Arc<Peer>, ServerError> {
        self.peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))
    }

    async fn handle_store_file(
        &self,
        from: &str,
        owner_id: &str,
        key: &str,
        size: u64,
    ) -> Result<(), ServerError> {
        let peer = self.known_peer(from)?;
        let deadline = Instant::now() + self.opts.fetch_timeout;

        let (claim, next) = wait_for_stream(peer.clone(), deadline).await?;
        let mut lease = match next {
            Ok(lease) => lease,
            Err(TransportError::StreamTimeout(addr)) => {
                self.discard_late_stream(peer, claim, Some(size));
                return Err(TransportError::StreamTimeout(addr).into());
            }
            Err(e) => return Err(e.into()),
        };
        drop(claim);

        let result = self.receive_stream(&mut lease, owner_id, key, size).await;
        lease.release();
        let n = result?;

        tracing::info!("[{}] written ({}) bytes to disk", self.transport.addr(), n);
        Ok(())
    }

    async fn handle_get_file(
        &self,
        from: &str,
        owner_id: &str,
        key: &str,
    ) -> Result<(), ServerError> {
        let peer = self.known_peer(from)?;

        if !self.store.exists(owner_id, key).await {
            // an empty answer, so the requester never waits on us for nothing
            peer.send(&empty_answer()).await?;
            return Err(StoreError::NotFound {
                owner_id: owner_id.to_string(),
                key: key.to_string(),
            }
            .into());
        }

        tracing::info!(
            "[{}] serving file ({}) over the network",
            self.transport.addr(),
            key
        );

        let (size, mut file) = self.store.read(owner_id, key).await?;

        let mut writer = peer.lock_writer().await;
        let mut header = [0u8; 9];
        header[0] = INCOMING_STREAM;
        header[1..].copy_from_slice(&(size + CIPHER_OVERHEAD).to_le_bytes());
        writer.write_all(&header).await?;
        let sent = encrypt_stream(&self.opts.encryption_key, &mut file, &mut *writer).await?;

        tracing::info!(
            "[{}] written ({}) bytes over the network to {}",
            self.transport.addr(),
            sent,
            from
        );
        Ok(())
    }

    async fn handle_delete_file(
        &self,
        from: &str,
        owner_id: &str,
        key: &str,
    ) -> Result<(), ServerError> {
        self.known_peer(from)?;
        self.store.delete(owner_id, key).await?;

        tracing::info!("[{}] deleted ({}) on request of {}", self.transport.addr(), key, from);
        Ok(())
    }
}

/// Stream marker followed by a zero size prefix.
fn empty_answer() -> [u8; 9] {
    let mut answer = [0u8; 9];
    answer[0] = INCOMING_STREAM;
    answer
}

/// Claims the peer's gate and waits for its next stream, both bounded by `deadline`.
/// The claim is returned alongside the outcome so a timed-out wait keeps owning the
/// stream that may still arrive.
async fn wait_for_stream(
    peer: Arc<Peer>,
    deadline: Instant,
) -> Result<(StreamClaim, Result<StreamLease, TransportError>), TransportError> {
    let mut claim = tokio::time::timeout_at(deadline, peer.claim_stream())
        .await
        .map_err(|_| TransportError::StreamTimeout(peer.addr().to_string()))?;
    let next = claim.next_until(deadline).await;
    Ok((claim, next))
}

async fn discard_stream(lease: &mut StreamLease, size: Option<u64>) -> std::io::Result<u64> {
    let size = match size {
        Some(size) => size,
        None => lease.reader().read_u64_le().await?,
    };
    tokio::io::copy(&mut lease.reader().take(size), &mut tokio::io::sink()).await
}
