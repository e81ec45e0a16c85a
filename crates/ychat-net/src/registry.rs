//! The server's `PeerId -> Peer` map.
//!
//! Only the coordination loop mutates it; everyone else sees snapshots.

use std::collections::HashMap;

use libp2p::PeerId;
use tracing::debug;

use crate::peer::{Peer, PeerStatus};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live peer. An existing entry for the same id is returned
    /// so the caller can close it.
    pub fn insert(&mut self, peer: Peer) -> Option<Peer> {
        debug!(
            peer = %peer.peer_id(),
            conn = peer.conn_id(),
            direction = ?peer.direction(),
            "Tracking peer stream"
        );
        self.peers.insert(peer.peer_id(), peer)
    }

    /// Remove `peer_id` only if it is still backed by stream `conn_id`.
    pub fn remove(&mut self, peer_id: &PeerId, conn_id: u64) -> Option<Peer> {
        match self.peers.get(peer_id) {
            Some(peer) if peer.conn_id() == conn_id => self.peers.remove(peer_id),
            _ => None,
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// Returns `false` if the peer is not registered.
    pub fn set_status(&mut self, peer_id: &PeerId, status: PeerStatus) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.set_status(status);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Close and forget every peer.
    pub fn close_all(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.close();
        }
    }
}
