//! Node Configuration
//!
//! Everything needed to bring one node up, loadable from a TOML file and overridable from
//! the command line. Every field has a default, so an empty file is a valid config.
//!
//! ## Owner ID
//! Files are stored and fetched under `<owner_id>/<key>`, and a `GetFile` asks peers for the
//! requester's own owner ID. A node can therefore only fetch what was stored under the same
//! owner ID: nodes that should serve each other's files must be configured with one shared
//! `owner_id`. Without one, the ID is generated once and kept in `<storage_root>/.owner_id`,
//! so repeated one-shot runs against the same root see the same files.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::key::{EncryptionKey, generate_id};
use crate::server::types::{DEFAULT_FETCH_TIMEOUT, DEFAULT_SETTLE_INTERVAL, FileServerOpts};
use crate::store::path::cas_path_transform;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:3000";

/// Owner ID file kept at the storage root when no owner ID is configured.
pub const OWNER_ID_FILE: &str = ".owner_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen_addr: String,
    /// Shared by every node that should serve the same files. When absent, loaded from
    /// (or generated into) `<storage_root>/.owner_id`.
    pub owner_id: Option<String>,
    /// Derived from `listen_addr` when absent.
    pub storage_root: Option<PathBuf>,
    pub bootstrap_nodes: Vec<String>,
    /// 64 hex characters. Generated when absent, which only works for a single node.
    pub encryption_key: Option<String>,
    pub settle_interval_ms: u64,
    pub fetch_timeout_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            owner_id: None,
            storage_root: None,
            bootstrap_nodes: Vec::new(),
            encryption_key: None,
            settle_interval_ms: DEFAULT_SETTLE_INTERVAL.as_millis() as u64,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl NodeConfig {
    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).context("invalid node configuration")
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Configured root, or `<host>_<port>_network` from the listen address
    /// (`127.0.0.1:3000` -> `127.0.0.1_3000_network`).
    pub fn storage_root(&self) -> PathBuf {
        if let Some(root) = &self.storage_root
            && !root.as_os_str().is_empty()
        {
            return root.clone();
        }

        let derived = self.listen_addr.replace([':', '/', '\\'], "_");
        PathBuf::from(format!("{}_network", derived))
    }

    /// Resolves defaults into server options. Fails on malformed key material or when the
    /// persisted owner ID cannot be read or written.
    pub fn into_opts(self) -> anyhow::Result<FileServerOpts> {
        let storage_root = self.storage_root();
        let encryption_key = match &self.encryption_key {
            Some(hex_key) => EncryptionKey::from_hex(hex_key).context("invalid encryption_key")?,
            None => EncryptionKey::generate(),
        };
        let id = match self.owner_id.filter(|id| !id.is_empty()) {
            Some(id) => id,
            None => load_or_create_owner_id(&storage_root)?,
        };

        Ok(FileServerOpts {
            id,
            encryption_key,
            storage_root,
            path_transform: cas_path_transform,
            bootstrap_nodes: self.bootstrap_nodes,
            settle_interval: Duration::from_millis(self.settle_interval_ms),
            fetch_timeout: Duration::from_millis(self.fetch_timeout_ms),
        })
    }
}

/// Reads the owner ID saved under `root`, generating and saving one on first use.
pub fn load_or_create_owner_id(root: &Path) -> anyhow::Result<String> {
    let path = root.join(OWNER_ID_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) if !content.trim().is_empty() => return Ok(content.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    }

    let id = generate_id();
    std::fs::create_dir_all(root)
        .with_context(|| format!("failed to create storage root {}", root.display()))?;
    std::fs::write(&path, &id).with_context(|| format!("failed to write {}", path.display()))?;

    tracing::info!("Generated owner ID {} (saved to {})", id, path.display());
    Ok(id)
}
