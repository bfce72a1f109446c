//! # Peer Set
//!
//! Id-keyed collection of peers behind a single reader-writer lock.
//! Iteration order is the lexical order of peer ids.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use shared_types::{Address, ZERO_ADDRESS};

use super::errors::CommError;
use super::peer::{CsPeerInfo, DisconnectReason, Peer};

#[derive(Default)]
struct Inner {
    peers: BTreeMap<String, Arc<Peer>>,
    closed: bool,
}

/// A set of connected peers.
#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<Inner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`. Never replaces an existing entry.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<(), CommError> {
        if peer.id().is_empty() {
            return Err(CommError::EmptyPeerId);
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CommError::PeerSetClosed);
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(CommError::AlreadyPresent(peer.id().to_string()));
        }
        inner.peers.insert(peer.id().to_string(), peer);
        Ok(())
    }

    /// Register `peer` only while the set holds fewer than `cap` peers.
    pub fn add_peer_capped(&self, peer: Arc<Peer>, cap: usize) -> Result<(), CommError> {
        if peer.id().is_empty() {
            return Err(CommError::EmptyPeerId);
        }

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CommError::PeerSetClosed);
        }
        if inner.peers.contains_key(peer.id()) {
            return Err(CommError::AlreadyPresent(peer.id().to_string()));
        }
        if inner.peers.len() >= cap {
            return Err(CommError::TooManyPeers);
        }
        inner.peers.insert(peer.id().to_string(), peer);
        Ok(())
    }

    pub fn remove_peer(&self, id: &str) -> Result<Arc<Peer>, CommError> {
        self.inner
            .write()
            .peers
            .remove(id)
            .ok_or_else(|| CommError::NotPresent(id.to_string()))
    }

    pub fn peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.inner.read().peers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.read().peers.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    /// Snapshot of the members.
    pub fn peers(&self) -> BTreeMap<String, Arc<Peer>> {
        self.inner.read().peers.clone()
    }

    pub fn peer_list(&self) -> Vec<Arc<Peer>> {
        self.inner.read().peers.values().cloned().collect()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.inner.read().peers.keys().cloned().collect()
    }

    /// Member that proved ownership of `address` during the handshake.
    pub fn peer_by_verifier_address(&self, address: &Address) -> Option<Arc<Peer>> {
        if *address == ZERO_ADDRESS {
            return None;
        }
        self.inner
            .read()
            .peers
            .values()
            .find(|p| p.verifier_address() == *address)
            .cloned()
    }

    /// Peer with the greatest reported head height. Ties go to the first visited.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        let inner = self.inner.read();
        let mut best: Option<(&Arc<Peer>, u64)> = None;
        for peer in inner.peers.values() {
            let height = peer.head().height;
            if best.map_or(true, |(_, h)| height > h) {
                best = Some((peer, height));
            }
        }
        best.map(|(p, _)| p.clone())
    }

    /// Atomically replace the members.
    pub fn replace_peers(&self, peers: BTreeMap<String, Arc<Peer>>) {
        self.inner.write().peers = peers;
    }

    /// Disconnect every member and refuse further additions.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        for peer in inner.peers.values() {
            peer.disconnect(DisconnectReason::Requested);
        }
        inner.closed = true;
    }

    pub fn peers_info(&self) -> Vec<CsPeerInfo> {
        self.inner.read().peers.values().map(|p| p.info()).collect()
    }

    pub fn node_names(&self) -> Vec<String> {
        self.inner.read().peers.values().map(|p| p.node_name()).collect()
    }
}
