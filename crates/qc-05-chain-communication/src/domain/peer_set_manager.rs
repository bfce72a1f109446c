//! # Peer Set Manager
//!
//! Four peer sets and the rules that route an admitted peer into them.
//!
//! ## Sets
//!
//! | Set | Members |
//! |-----|---------|
//! | base | normal / mine-master peers, and verifiers outside the local verifier window |
//! | current verifier | verifiers of the current slot |
//! | next verifier | verifiers of the next slot (may overlap current) |
//! | verifier boot | listed verifier-boot nodes |
//!
//! Admission and rotation take the same mutex, so a peer is never
//! classified against a half-rotated verifier window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use shared_types::{Address, NodeType};
use tracing::{debug, info};

use super::errors::CommError;
use super::node::{PeerClass, SelfRole};
use super::peer::{CsPeerInfo, DisconnectReason, Peer};
use super::peer_set::PeerSet;

/// Cap of each verifier set.
pub const PBFT_MAX_PEER_COUNT: usize = 40;

/// Cap of the base set after a rotation.
pub const NORMAL_MAX_PEER_COUNT: usize = 45;

/// Default overall peer cap.
pub const P2P_MAX_PEER_COUNT: usize = 100;

/// Verifier-window predicates consulted during admission.
pub trait VerifierClassifier {
    fn is_current_verifier(&self, peer: &Peer) -> bool;

    fn is_next_verifier(&self, peer: &Peer) -> bool;

    fn is_verifier_boot(&self, peer: &Peer) -> bool;

    fn self_is_current_verifier(&self) -> bool;

    fn self_is_next_verifier(&self) -> bool;
}

/// Snapshot of all four sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CsPmPeerInfo {
    pub base: Vec<CsPeerInfo>,
    pub current_verifiers: Vec<CsPeerInfo>,
    pub next_verifiers: Vec<CsPeerInfo>,
    pub verifier_boots: Vec<CsPeerInfo>,
}

pub struct PeerSetManager {
    self_role: SelfRole,
    max_peers: usize,
    base: PeerSet,
    current_verifiers: PeerSet,
    next_verifiers: PeerSet,
    verifier_boots: PeerSet,
    admission: Mutex<()>,
}

impl PeerSetManager {
    pub fn new(self_role: SelfRole, max_peers: usize) -> Self {
        Self {
            self_role,
            max_peers,
            base: PeerSet::new(),
            current_verifiers: PeerSet::new(),
            next_verifiers: PeerSet::new(),
            verifier_boots: PeerSet::new(),
            admission: Mutex::new(()),
        }
    }

    pub fn self_role(&self) -> SelfRole {
        self.self_role
    }

    pub fn max_peers(&self) -> usize {
        self.max_peers
    }

    pub fn base(&self) -> &PeerSet {
        &self.base
    }

    pub fn current_verifiers(&self) -> &PeerSet {
        &self.current_verifiers
    }

    pub fn next_verifiers(&self) -> &PeerSet {
        &self.next_verifiers
    }

    pub fn verifier_boots(&self) -> &PeerSet {
        &self.verifier_boots
    }

    pub fn set(&self, class: PeerClass) -> &PeerSet {
        match class {
            PeerClass::Base => &self.base,
            PeerClass::CurrentVerifier => &self.current_verifiers,
            PeerClass::NextVerifier => &self.next_verifiers,
            PeerClass::VerifierBoot => &self.verifier_boots,
        }
    }

    fn sets(&self) -> [(PeerClass, &PeerSet); 4] {
        [
            (PeerClass::Base, &self.base),
            (PeerClass::CurrentVerifier, &self.current_verifiers),
            (PeerClass::NextVerifier, &self.next_verifiers),
            (PeerClass::VerifierBoot, &self.verifier_boots),
        ]
    }

    /// Base cap when verifier slots are reserved.
    fn reserved_base_cap(&self) -> usize {
        self.max_peers.saturating_sub(PBFT_MAX_PEER_COUNT)
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Target sets (with their caps) for `peer`.
    fn classify(
        &self,
        peer: &Peer,
        classifier: &dyn VerifierClassifier,
    ) -> Result<Vec<(PeerClass, usize)>, CommError> {
        if self.self_role == SelfRole::Base {
            return Ok(vec![(PeerClass::Base, self.max_peers)]);
        }

        let base = vec![(PeerClass::Base, self.reserved_base_cap())];
        match peer.node_type() {
            NodeType::Normal | NodeType::MineMaster => Ok(base),
            NodeType::Verifier => {
                let (in_current, in_next, cap) = if self.self_role == SelfRole::Verifier {
                    let self_current = classifier.self_is_current_verifier();
                    let self_next = classifier.self_is_next_verifier();
                    if !self_current && !self_next {
                        return Ok(base);
                    }
                    (
                        self_current && classifier.is_current_verifier(peer),
                        self_next && classifier.is_next_verifier(peer),
                        PBFT_MAX_PEER_COUNT - 1,
                    )
                } else {
                    (
                        classifier.is_current_verifier(peer),
                        classifier.is_next_verifier(peer),
                        PBFT_MAX_PEER_COUNT,
                    )
                };

                let mut targets = Vec::with_capacity(2);
                if in_current {
                    targets.push((PeerClass::CurrentVerifier, cap));
                }
                if in_next {
                    targets.push((PeerClass::NextVerifier, cap));
                }
                if targets.is_empty() {
                    Ok(base)
                } else {
                    Ok(targets)
                }
            }
            NodeType::VerifierBoot => {
                if classifier.is_verifier_boot(peer) {
                    Ok(vec![(PeerClass::VerifierBoot, PBFT_MAX_PEER_COUNT)])
                } else {
                    Ok(Vec::new())
                }
            }
            other => Err(CommError::IllegalNodeType(other)),
        }
    }

    /// Admit `peer` into the sets its role selects.
    ///
    /// Returns the sets joined; an empty list means the peer was ignored
    /// (an unlisted verifier-boot node). Either every target set accepts the
    /// peer or none does.
    pub fn add_peer(
        &self,
        peer: Arc<Peer>,
        classifier: &dyn VerifierClassifier,
    ) -> Result<Vec<PeerClass>, CommError> {
        let _guard = self.admission.lock();

        if peer.id().is_empty() {
            return Err(CommError::EmptyPeerId);
        }
        if self.contains(peer.id()) {
            return Err(CommError::AlreadyPresent(peer.id().to_string()));
        }

        let targets = self.classify(&peer, classifier)?;
        for (class, cap) in &targets {
            if self.set(*class).len() >= *cap {
                return Err(CommError::TooManyPeers);
            }
        }

        let mut joined = Vec::with_capacity(targets.len());
        for (class, _) in targets {
            if let Err(e) = self.set(class).add_peer(peer.clone()) {
                for done in &joined {
                    let _ = self.set(*done).remove_peer(peer.id());
                }
                return Err(e);
            }
            joined.push(class);
        }

        debug!(peer = %peer.id(), sets = ?joined, "peer admitted");
        Ok(joined)
    }

    /// Remove `id` from every set and hard-disconnect it.
    pub fn remove_peer(&self, id: &str) -> Option<Arc<Peer>> {
        let mut removed = None;
        for (_, set) in self.sets() {
            if let Ok(peer) = set.remove_peer(id) {
                removed = Some(peer);
            }
        }
        if let Some(peer) = &removed {
            peer.disconnect(DisconnectReason::Requested);
        }
        removed
    }

    // =========================================================================
    // LOOKUP
    // =========================================================================

    pub fn contains(&self, id: &str) -> bool {
        self.sets().iter().any(|(_, set)| set.contains(id))
    }

    pub fn get_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.sets().iter().find_map(|(_, set)| set.peer(id))
    }

    /// Union of all sets keyed by peer id.
    pub fn get_peers(&self) -> HashMap<String, Arc<Peer>> {
        let mut all = HashMap::new();
        for (_, set) in self.sets() {
            all.extend(set.peers());
        }
        all
    }

    pub fn peer_count(&self) -> usize {
        self.get_peers().len()
    }

    /// Best peer across all sets.
    pub fn best_peer(&self) -> Option<Arc<Peer>> {
        let mut best: Option<Arc<Peer>> = None;
        for (_, set) in self.sets() {
            if let Some(candidate) = set.best_peer() {
                let better = best
                    .as_ref()
                    .map_or(true, |b| candidate.head().height > b.head().height);
                if better {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    /// Whether the role-specific connection budget is exhausted.
    pub fn check_conn_count(&self) -> bool {
        match self.self_role {
            SelfRole::Base => self.base.len() >= self.max_peers,
            SelfRole::Verifier | SelfRole::Boot => {
                self.current_verifiers.len() >= PBFT_MAX_PEER_COUNT
                    && self.base.len() >= self.reserved_base_cap()
            }
        }
    }

    // =========================================================================
    // ROTATION
    // =========================================================================

    /// Re-partition base, current and next by declared verifier address.
    ///
    /// Verifier-boot peers are untouched. Base keeps at most
    /// [`NORMAL_MAX_PEER_COUNT`] peers; the overflow is disconnected. Returns
    /// the number of disconnected peers.
    pub fn organize_verifiers_set(&self, current: &[Address], next: &[Address]) -> usize {
        let _guard = self.admission.lock();

        let mut union: BTreeMap<String, Arc<Peer>> = BTreeMap::new();
        for set in [&self.base, &self.current_verifiers, &self.next_verifiers] {
            for (id, peer) in set.peers() {
                union.entry(id).or_insert(peer);
            }
        }

        let mut base = BTreeMap::new();
        let mut cur = BTreeMap::new();
        let mut nxt = BTreeMap::new();
        let mut overflow = Vec::new();

        for (id, peer) in union {
            let address = peer.verifier_address();
            let has_address = peer.has_verifier_address();
            let in_current = has_address && current.contains(&address);
            let in_next = has_address && next.contains(&address);

            if in_current {
                cur.insert(id.clone(), peer.clone());
            }
            if in_next {
                nxt.insert(id.clone(), peer.clone());
            }
            if !in_current && !in_next {
                if base.len() < NORMAL_MAX_PEER_COUNT {
                    base.insert(id, peer);
                } else {
                    overflow.push(peer);
                }
            }
        }

        info!(
            base = base.len(),
            current = cur.len(),
            next = nxt.len(),
            dropped = overflow.len(),
            "verifier sets reorganized"
        );

        self.base.replace_peers(base);
        self.current_verifiers.replace_peers(cur);
        self.next_verifiers.replace_peers(nxt);

        for peer in &overflow {
            peer.disconnect(DisconnectReason::BaseOverflow);
        }
        overflow.len()
    }

    /// Move base peers whose verifier address is listed in `next` into the
    /// next-verifier set.
    pub fn pick_next_verifiers_from_base(&self, next: &[Address]) -> usize {
        let _guard = self.admission.lock();
        let mut moved = 0;
        for peer in self.base.peer_list() {
            if !peer.has_verifier_address() || !next.contains(&peer.verifier_address()) {
                continue;
            }
            if self.next_verifiers.add_peer(peer.clone()).is_ok() {
                let _ = self.base.remove_peer(peer.id());
                moved += 1;
            }
        }
        moved
    }

    /// Add current-verifier peers listed in `next` to the next-verifier set.
    pub fn add_current_verifiers_to_next(&self, next: &[Address]) -> usize {
        let _guard = self.admission.lock();
        let mut added = 0;
        for peer in self.current_verifiers.peer_list() {
            if !peer.has_verifier_address() || !next.contains(&peer.verifier_address()) {
                continue;
            }
            if self.next_verifiers.add_peer(peer).is_ok() {
                added += 1;
            }
        }
        added
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    pub fn info(&self) -> CsPmPeerInfo {
        CsPmPeerInfo {
            base: self.base.peers_info(),
            current_verifiers: self.current_verifiers.peers_info(),
            next_verifiers: self.next_verifiers.peers_info(),
            verifier_boots: self.verifier_boots.peers_info(),
        }
    }

    /// Disconnect everyone and refuse further admissions.
    pub fn close(&self) {
        let _guard = self.admission.lock();
        for (_, set) in self.sets() {
            set.close();
        }
    }
}

#[cfg(test)]
mod tests;
