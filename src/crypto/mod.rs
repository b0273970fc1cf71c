//! Cipher Codec Module
//!
//! Streaming symmetric encryption used for every byte that crosses the network.
//!
//! ## Core Concepts
//! - **Key material**: 32-byte keys for AES-256, shared by all nodes of one cluster.
//! - **Counter mode**: AES-256-CTR turns the block cipher into a keystream, so ciphertext
//!   is exactly as long as plaintext and can be produced chunk by chunk.
//! - **Preamble**: every encrypted stream starts with a fresh random 16-byte IV, which makes
//!   repeated encryption of the same plaintext produce different ciphertext.

pub mod cipher;
pub mod key;
