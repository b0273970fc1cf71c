//! Connection Transport Module
//!
//! Owns the TCP sockets between nodes: accepting, dialing, framing inbound bytes and handing
//! a live socket over to whoever needs to drain a raw file stream from it.
//!
//! ## Wire Format
//! Every unit starts with one marker byte:
//! - `0` (**control message**): followed by a 4-byte little-endian length and that many
//!   bytes of encoded envelope.
//! - `1` (**raw stream**): nothing else is framed; raw bytes follow and belong to the
//!   consumer that holds the connection's stream gate.
//!
//! ## Core Mechanisms
//! - **Framing loop**: one task per connection decodes units and publishes control messages
//!   on a single inbound queue.
//! - **Stream gate**: on a stream marker the loop lends its reader out as a
//!   [`peer::StreamLease`] and stays parked until the lease is released, so control frames and
//!   file bytes never interleave on one socket.
//! - **Hooks**: a pluggable handshake and an `on_peer` callback run before any frame is read.

pub mod codec;
pub mod fanout;
pub mod peer;
pub mod tcp;
pub mod types;
