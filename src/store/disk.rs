use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::path::{PathKey, PathTransform, cas_path_transform};
use crate::crypto::cipher::{CipherError, decrypt_stream};
use crate::crypto::key::EncryptionKey;

/// Root folder used when none is configured.
pub const DEFAULT_ROOT: &str = "dfs_network";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key '{key}' not found for owner {owner_id}")]
    NotFound { owner_id: String, key: String },

    #[error("owner ID '{0}' is not a plain directory name")]
    InvalidOwner(String),

    #[error("key '{0}' resolves outside its owner directory")]
    InvalidKey(String),

    #[error(transparent)]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Disk-backed content-addressable store.
///
/// Every key resolves to `root / owner_id / path segments... / file name`.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    /// Creates a store rooted at `root` (or [`DEFAULT_ROOT`] if empty).
    pub fn new(root: impl Into<PathBuf>, transform: PathTransform) -> Self {
        let root = root.into();
        let root = if root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            root
        };

        Self { root, transform }
    }

    /// Store with the content-addressed layout.
    pub fn with_cas(root: impl Into<PathBuf>) -> Self {
        Self::new(root, cas_path_transform)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.transform)(key)
    }

    /// Absolute location of a key for the given owner.
    ///
    /// Fails unless the owner ID and every part of the key's path are plain names, so the
    /// result always stays below `root/<owner ID>/`.
    pub fn resolve(&self, owner_id: &str, key: &str) -> Result<PathBuf, StoreError> {
        let owner_root = self.owner_root(owner_id)?;
        let path_key = self.path_key(key);

        let file_name = Path::new(&path_key.file_name);
        if !is_plain(&path_key.dir_path())
            || file_name.components().count() != 1
            || !is_plain(file_name)
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        Ok(owner_root.join(path_key.full_path()))
    }

    /// `false` for anything that does not resolve, including invalid owner IDs.
    pub async fn exists(&self, owner_id: &str, key: &str) -> bool {
        let Ok(path) = self.resolve(owner_id, key) else {
            return false;
        };
        fs::try_exists(path).await.unwrap_or(false)
    }

    /// Copies everything from `reader` into the key's file, replacing any previous content.
    /// Returns the number of bytes written.
    pub async fn write<R>(
        &self,
        owner_id: &str,
        key: &str,
        mut reader: R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.resolve(owner_id, key)?;
        let mut file = self.open_for_writing(&path).await?;
        let n = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        tracing::debug!("wrote {} bytes for key '{}' (owner {})", n, key, owner_id);
        Ok(n)
    }

    /// Like [`Store::write`], but `reader` yields an encrypted stream that is decrypted
    /// on the way to disk. Returns the plaintext byte count.
    pub async fn write_decrypted<R>(
        &self,
        enc_key: &EncryptionKey,
        owner_id: &str,
        key: &str,
        mut reader: R,
    ) -> Result<u64, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let path = self.resolve(owner_id, key)?;
        let mut file = self.open_for_writing(&path).await?;
        let n = match decrypt_stream(enc_key, &mut reader, &mut file).await {
            Ok(n) => n,
            Err(e) => {
                // a half-decrypted file must not be served later
                drop(file);
                ignore_missing(fs::remove_file(&path).await)?;
                return Err(e.into());
            }
        };

        tracing::debug!(
            "wrote {} decrypted bytes for key '{}' (owner {})",
            n,
            key,
            owner_id
        );
        Ok(n)
    }

    /// Opens the key's file, returning its size and a handle positioned at the start.
    pub async fn read(&self, owner_id: &str, key: &str) -> Result<(u64, File), StoreError> {
        let path = self.resolve(owner_id, key)?;

        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    owner_id: owner_id.to_string(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();

        Ok((size, file))
    }

    /// Removes the whole first-segment subtree the key lives in. Keys sharing that
    /// segment are removed with it.
    pub async fn delete(&self, owner_id: &str, key: &str) -> Result<(), StoreError> {
        let path = self.resolve(owner_id, key)?;
        let path_key = self.path_key(key);
        let owner_root = self.owner_root(owner_id)?;

        let result = match path_key.first_path_name() {
            Some(first) => fs::remove_dir_all(owner_root.join(first)).await,
            None => fs::remove_file(&path).await,
        };
        ignore_missing(result)?;

        tracing::debug!("deleted [{}] from disk", path_key.file_name);
        Ok(())
    }

    /// Removes the entire root, for every owner.
    pub async fn clear(&self) -> Result<(), StoreError> {
        ignore_missing(fs::remove_dir_all(&self.root).await)?;
        Ok(())
    }

    fn owner_root(&self, owner_id: &str) -> Result<PathBuf, StoreError> {
        let owner = Path::new(owner_id);
        if owner.components().count() != 1 || !is_plain(owner) {
            return Err(StoreError::InvalidOwner(owner_id.to_string()));
        }
        Ok(self.root.join(owner_id))
    }

    async fn open_for_writing(&self, path: &Path) -> Result<File, StoreError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        Ok(File::create(path).await?)
    }
}

/// Only ordinary names: no root, prefix, `.` or `..` components.
fn is_plain(path: &Path) -> bool {
    path.components()
        .all(|component| matches!(component, Component::Normal(_)))
}

fn ignore_missing(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
