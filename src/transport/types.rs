use std::sync::Arc;
use thiserror::Error;

use super::peer::Peer;

/// Marker byte announcing a length-prefixed control message.
pub const INCOMING_MESSAGE: u8 = 0x0;
/// Marker byte announcing raw stream bytes.
pub const INCOMING_STREAM: u8 = 0x1;

/// Depth of the inbound queue shared by all connections.
pub const RPC_QUEUE_DEPTH: usize = 1024;

/// Runs right after a connection is wrapped, before it is registered.
/// An error drops the connection.
pub type HandshakeFn = Arc<dyn Fn(&Peer) -> anyhow::Result<()> + Send + Sync>;

/// Registers a freshly connected peer. An error drops the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<Peer>) -> anyhow::Result<()> + Send + Sync>;

/// One decoded unit read off a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rpc {
    /// Remote address of the connection the unit arrived on.
    pub from: String,
    /// The socket is about to carry a raw stream instead of another frame.
    pub stream: bool,
    /// Encoded envelope (empty for stream units).
    pub payload: Vec<u8>,
}

/// Accepts every connection.
pub fn nop_handshake() -> HandshakeFn {
    Arc::new(|_peer: &Peer| -> anyhow::Result<()> { Ok(()) })
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake with {addr} failed: {reason}")]
    Handshake { addr: String, reason: String },

    #[error("peer {addr} rejected: {reason}")]
    Rejected { addr: String, reason: String },

    #[error("unknown frame marker {0:#04x}")]
    UnknownMarker(u8),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u64),

    #[error("no stream from {0} within the timeout")]
    StreamTimeout(String),

    #[error("inbound queue has already been consumed")]
    AlreadyConsumed,

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
