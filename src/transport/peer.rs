use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard, mpsc, oneshot};

use super::types::TransportError;

/// Read side of a connection, owned by its framing loop between streams.
pub type ConnReader = BufReader<OwnedReadHalf>;

/// A live connection to a remote node.
///
/// Writes go through [`Peer::send`] or a held writer lock. The read side stays with the
/// framing loop and is only ever lent out through the stream gate.
pub struct Peer {
    addr: SocketAddr,
    outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
    // Single-slot gate: at most one lease exists per connection because the framing
    // loop is parked until the lease it published comes back.
    gate_tx: mpsc::Sender<StreamLease>,
    gate_rx: Arc<Mutex<mpsc::Receiver<StreamLease>>>,
}

impl Peer {
    /// Splits the socket. The returned reader belongs to the framing loop.
    pub fn new(conn: TcpStream, outbound: bool) -> std::io::Result<(Self, ConnReader)> {
        let addr = conn.peer_addr()?;
        let (read_half, write_half) = conn.into_split();
        let (gate_tx, gate_rx) = mpsc::channel(1);

        let peer = Self {
            addr,
            outbound,
            writer: Mutex::new(write_half),
            gate_tx,
            gate_rx: Arc::new(Mutex::new(gate_rx)),
        };

        Ok((peer, BufReader::new(read_half)))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `true` if we dialed the connection, `false` if we accepted it.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Writes `bytes` in one piece; nothing else can interleave with them.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Exclusive write access, e.g. for the duration of a raw stream.
    pub async fn lock_writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Shuts down our write side of the connection.
    pub async fn close(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    /// Called by the framing loop after a stream marker: lends the reader out and waits
    /// until the lease is released (or dropped).
    pub(crate) async fn arm_stream_gate(
        &self,
        reader: OwnedMutexGuard<ConnReader>,
    ) -> Result<(), TransportError> {
        let (released, wait) = oneshot::channel();
        let lease = StreamLease {
            from: self.addr,
            reader,
            released,
        };

        self.gate_tx
            .send(lease)
            .await
            .map_err(|_| TransportError::Closed)?;

        // A dropped sender means the lease went away without an explicit release.
        let _ = wait.await;
        Ok(())
    }

    /// Reserves this connection's gate. Until the claim is dropped, every stream the
    /// framing loop publishes goes to its holder and nobody else.
    pub async fn claim_stream(&self) -> StreamClaim {
        StreamClaim {
            from: self.addr,
            rx: self.gate_rx.clone().lock_owned().await,
        }
    }

    /// Waits for the framing loop to hand over the socket for the next raw stream.
    pub async fn take_stream(&self) -> Result<StreamLease, TransportError> {
        self.claim_stream().await.next().await
    }

    /// [`Peer::take_stream`] bounded by `timeout`.
    ///
    /// A stream arriving after the timeout is left for the next consumer; use
    /// [`Peer::claim_stream`] to keep ownership of late streams.
    pub async fn take_stream_timeout(
        &self,
        timeout: Duration,
    ) -> Result<StreamLease, TransportError> {
        tokio::time::timeout(timeout, self.take_stream())
            .await
            .map_err(|_| TransportError::StreamTimeout(self.addr.to_string()))?
    }
}

/// Exclusive right to receive the streams of one connection.
pub struct StreamClaim {
    from: SocketAddr,
    rx: OwnedMutexGuard<mpsc::Receiver<StreamLease>>,
}

impl StreamClaim {
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    /// Next stream on the connection.
    pub async fn next(&mut self) -> Result<StreamLease, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    /// [`StreamClaim::next`] with a deadline. On timeout the claim stays valid, so a
    /// stream that shows up later is still delivered here.
    pub async fn next_until(
        &mut self,
        deadline: tokio::time::Instant,
    ) -> Result<StreamLease, TransportError> {
        match tokio::time::timeout_at(deadline, self.rx.recv()).await {
            Ok(Some(lease)) => Ok(lease),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::StreamTimeout(self.from.to_string())),
        }
    }
}

impl fmt::Debug for StreamClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClaim").field("from", &self.from).finish()
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}

/// Exclusive read access to one connection for the duration of a raw stream.
///
/// The holder must read exactly the announced number of bytes. Releasing (or dropping)
/// the lease resumes frame decoding on that connection.
pub struct StreamLease {
    from: SocketAddr,
    reader: OwnedMutexGuard<ConnReader>,
    released: oneshot::Sender<()>,
}

impl StreamLease {
    pub fn from(&self) -> SocketAddr {
        self.from
    }

    pub fn reader(&mut self) -> &mut ConnReader {
        &mut self.reader
    }

    /// Hands the socket back to the framing loop.
    pub fn release(self) {
        let StreamLease {
            from,
            reader,
            released,
        } = self;
        drop(reader);

        if released.send(()).is_err() {
            tracing::debug!("[{}] framing loop gone before stream release", from);
        }
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease").field("from", &self.from).finish()
    }
}
