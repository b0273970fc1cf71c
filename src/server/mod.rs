//! File Server Module
//!
//! Turns the local store and the transport into network-wide `store`, `get` and `delete`
//! operations, and dispatches control messages arriving from other nodes.
//!
//! ## Data Flow
//! - **Store**: the payload is written locally and kept in memory; a `StoreFile` envelope is
//!   broadcast, and after the settle interval the encrypted payload is fanned out to every
//!   peer on raw streams.
//! - **Get**: served locally when present. Otherwise a `GetFile` envelope is broadcast and
//!   each peer's answer (size prefix + encrypted payload) is decrypted into the local store.
//! - **Delete**: local subtree removal followed by a `DeleteFile` broadcast. No acknowledgment.
//!
//! ## Submodules
//! - **`types`**: server options and the error type.
//! - **`protocol`**: the control envelope exchanged between nodes.
//! - **`registry`**: the shared table of connected peers.
//! - **`service`**: the `FileServer` itself.

pub mod protocol;
pub mod registry;
pub mod service;
pub mod types;
