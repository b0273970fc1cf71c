//! Distributed File Store Library
//!
//! A peer-to-peer, content-addressed file store. Every node keeps files on local disk and
//! replicates them, encrypted in flight, to the nodes it is connected to.
//!
//! ## Architecture Modules
//! - **`crypto`**: streaming AES-256-CTR with a random IV preamble, key material and IDs.
//! - **`store`**: maps keys to SHA-1 derived paths under a per-owner root and performs
//!   plain or decrypting file I/O.
//! - **`transport`**: TCP connections, frame decoding and the per-connection stream gate
//!   that lends a socket out for raw file bytes.
//! - **`server`**: network-wide store/get/delete and the dispatch of peer messages.
//! - **`config`** / **`node`**: loading a node's settings and wiring the pieces together.

pub mod config;
pub mod crypto;
pub mod node;
pub mod server;
pub mod store;
pub mod transport;
