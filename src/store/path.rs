use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Width of one directory level produced by [`cas_path_transform`].
pub const CAS_BLOCK_SIZE: usize = 5;

/// Turns a logical key into its on-disk location.
pub type PathTransform = fn(&str) -> PathKey;

/// Where a logical key lives, relative to `root/<owner ID>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    /// Directory segments joined by `/`.
    pub path_name: String,
    /// Leaf file name.
    pub file_name: String,
}

impl PathKey {
    pub fn new(path_name: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            path_name: path_name.into(),
            file_name: file_name.into(),
        }
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path_name.split('/').filter(|segment| !segment.is_empty())
    }

    /// The top-level directory, i.e. the unit removed by a delete.
    pub fn first_path_name(&self) -> Option<&str> {
        self.segments().next()
    }

    /// Directory part as a relative path.
    pub fn dir_path(&self) -> PathBuf {
        self.segments().collect()
    }

    /// Directories plus file name as a relative path.
    pub fn full_path(&self) -> PathBuf {
        self.dir_path().join(&self.file_name)
    }
}

/// Content-addressed layout: SHA-1 of the key, hex encoded, split into
/// [`CAS_BLOCK_SIZE`] wide directories; the full digest is the file name.
///
/// `"momsbestpicture"` resolves to
/// `68044/29f74/181a6/3c50c/3d81d/733a1/2f14a/353ff/6804429f74181a63c50c3d81d733a12f14a353ff`.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let segments: Vec<&str> = (0..digest.len() / CAS_BLOCK_SIZE)
        .map(|i| &digest[i * CAS_BLOCK_SIZE..(i + 1) * CAS_BLOCK_SIZE])
        .collect();

    let path_name = segments.join("/");

    PathKey::new(path_name, digest)
}

/// Stores the key verbatim: `<key>/<key>`.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey::new(key, key)
}
