//! Content-Addressable Storage Module
//!
//! Maps `(owner ID, logical key)` pairs to deterministic locations on disk and performs
//! plain or decrypting byte-stream I/O against them.
//!
//! ## Core Concepts
//! - **Path transform**: a pure function of the key alone. The production transform hashes
//!   the key with SHA-1 and fans the 40 hex characters out into 5-character directories.
//! - **Owner partitioning**: every path is rooted at `root/<owner ID>/`, so one process can
//!   host several logical tenants side by side.
//! - **Bucket deletion**: deleting a key removes the whole subtree of its first path segment,
//!   which may take sibling keys sharing that segment with it.

pub mod disk;
pub mod path;
