//! Peer Registry
//!
//! Shared table of live connections keyed by remote address. Written from the transport's
//! connection setup (`on_peer`) and read by broadcasts and dispatch.

use dashmap::DashMap;
use std::sync::Arc;

use crate::transport::peer::Peer;

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a peer, replacing any previous connection from the same address.
    pub fn register(&self, peer: Arc<Peer>) {
        let addr = peer.addr().to_string();
        if self.peers.insert(addr.clone(), peer).is_some() {
            tracing::debug!("Replaced existing connection to {}", addr);
        }
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Peer>> {
        self.peers.get(addr).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, addr: &str) -> Option<Arc<Peer>> {
        self.peers.remove(addr).map(|(_, peer)| peer)
    }

    /// Point-in-time copy of all peers, ordered by address.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by_key(|peer| peer.addr());
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
