use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::crypto::cipher::CipherError;
use crate::crypto::key::{EncryptionKey, generate_id};
use crate::store::disk::{DEFAULT_ROOT, StoreError};
use crate::store::path::{PathTransform, cas_path_transform};
use crate::transport::types::TransportError;

/// Default wait between a control broadcast and the raw bytes that follow it.
pub const DEFAULT_SETTLE_INTERVAL: Duration = Duration::from_millis(1000);
/// Default bound on waiting for a peer's raw stream.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_millis(5000);

/// Construction parameters of a [`super::service::FileServer`].
#[derive(Debug, Clone)]
pub struct FileServerOpts {
    /// Owner ID this node stores under. Empty means "generate one".
    pub id: String,
    /// Cluster-wide key for everything sent over the network.
    pub encryption_key: EncryptionKey,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    /// Addresses dialed on start. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
    pub settle_interval: Duration,
    pub fetch_timeout: Duration,
}

impl Default for FileServerOpts {
    fn default() -> Self {
        Self {
            id: generate_id(),
            encryption_key: EncryptionKey::generate(),
            storage_root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
            bootstrap_nodes: Vec::new(),
            settle_interval: DEFAULT_SETTLE_INTERVAL,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("message from unknown peer {0}")]
    UnknownPeer(String),

    #[error("failed to send to peer {addr}: {source}")]
    Send {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
