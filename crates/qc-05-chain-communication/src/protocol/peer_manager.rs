//! # Cs Peer Manager
//!
//! Shared core behind the protocol manager: the four peer sets plus the
//! verifier-window predicates that classify peers into them. Services hold
//! an `Arc<CsPeerManager>` through the [`PeerManager`] and
//! [`AbsPeerManager`] ports instead of the protocol manager itself.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use shared_types::{Address, ZERO_ADDRESS};
use tracing::{debug, info, warn};

use crate::config::ChainCommConfig;
use crate::domain::{
    CommError, CsPmPeerInfo, Msg, NodeUrl, Peer, PeerClass, PeerSetManager, SelfRole,
    VerifierClassifier,
};
use crate::ports::{AbsPeerManager, ChainReader, ConsensusEngine, PeerManager, VerifiersReader};

/// Blocks the local head may trail the best peer before `is_sync` reports true.
const SYNC_HEIGHT_SLACK: u64 = 10;

pub struct CsPeerManager {
    config: Arc<ChainCommConfig>,
    psm: PeerSetManager,
    chain: Arc<dyn ChainReader>,
    verifiers: Arc<dyn VerifiersReader>,
    consensus: Arc<dyn ConsensusEngine>,
    self_node: NodeUrl,
    self_address: Address,
    verifier_boots: Vec<NodeUrl>,
    verifier_boot_ids: HashSet<String>,
}

impl CsPeerManager {
    pub fn new(
        config: Arc<ChainCommConfig>,
        self_role: SelfRole,
        self_node: NodeUrl,
        self_address: Address,
        verifier_boots: Vec<NodeUrl>,
        chain: Arc<dyn ChainReader>,
        verifiers: Arc<dyn VerifiersReader>,
        consensus: Arc<dyn ConsensusEngine>,
    ) -> Self {
        let verifier_boot_ids = verifier_boots.iter().map(|u| u.id().to_string()).collect();
        Self {
            psm: PeerSetManager::new(self_role, config.node.max_peers),
            config,
            chain,
            verifiers,
            consensus,
            self_node,
            self_address,
            verifier_boots,
            verifier_boot_ids,
        }
    }

    pub fn config(&self) -> &Arc<ChainCommConfig> {
        &self.config
    }

    pub fn psm(&self) -> &PeerSetManager {
        &self.psm
    }

    pub fn chain(&self) -> &Arc<dyn ChainReader> {
        &self.chain
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusEngine> {
        &self.consensus
    }

    pub fn self_node(&self) -> &NodeUrl {
        &self.self_node
    }

    pub fn self_address(&self) -> Address {
        self.self_address
    }

    pub fn verifier_boot_urls(&self) -> &[NodeUrl] {
        &self.verifier_boots
    }

    // =========================================================================
    // VERIFIER WINDOW
    // =========================================================================

    /// `(current, next)` verifier addresses. Between a change point and the
    /// store swapping its lists, the announced next list is already current.
    pub fn verifier_lists(&self) -> (Vec<Address>, Vec<Address>) {
        if self.verifiers.should_change_current() {
            (self.verifiers.next_verifiers(), Vec::new())
        } else {
            (
                self.verifiers.current_verifiers(),
                self.verifiers.next_verifiers(),
            )
        }
    }

    fn is_current_address(&self, address: &Address) -> bool {
        *address != ZERO_ADDRESS && self.verifier_lists().0.contains(address)
    }

    fn is_next_address(&self, address: &Address) -> bool {
        *address != ZERO_ADDRESS && self.verifier_lists().1.contains(address)
    }

    /// Expected peers per verifier set: the committee minus ourselves.
    pub fn expected_verifier_peers(&self) -> usize {
        self.config.chain.verifier_number.saturating_sub(1)
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    /// Admit a handshaken peer.
    pub fn add_peer(&self, peer: Arc<Peer>) -> Result<Vec<PeerClass>, CommError> {
        self.psm.add_peer(peer, self)
    }

    /// Refuse a second peer claiming an address already present in the
    /// current or next set.
    pub fn check_duplicate_verifier(&self, peer: &Peer) -> Result<(), CommError> {
        let address = peer.verifier_address();
        if self.is_current_verifier(peer)
            && self
                .psm
                .current_verifiers()
                .peer_by_verifier_address(&address)
                .is_some()
        {
            return Err(CommError::DuplicateCurrentVerifierAddress);
        }
        if self.is_next_verifier(peer)
            && self
                .psm
                .next_verifiers()
                .peer_by_verifier_address(&address)
                .is_some()
        {
            return Err(CommError::DuplicateNextVerifierAddress);
        }
        Ok(())
    }

    // =========================================================================
    // ROTATION
    // =========================================================================

    /// Rotate at a change point: the next list becomes current.
    pub fn change_verifiers(&self) -> Result<(), CommError> {
        let next = self.verifiers.next_verifiers();
        let Some(primary) = next.first().copied() else {
            return Err(CommError::NotInVerifierCache);
        };

        if self.psm.self_role() == SelfRole::Verifier {
            self.consensus.change_primary(primary);
        }
        self.psm.organize_verifiers_set(&next, &[]);
        info!(verifiers = next.len(), "verifier sets rotated at change point");
        Ok(())
    }

    /// Pull known next verifiers into the next set while it is short.
    pub fn match_current_verifiers_to_next(&self) {
        if !VerifierClassifier::self_is_next_verifier(self) {
            return;
        }
        if self.psm.next_verifiers().len() >= self.expected_verifier_peers() {
            return;
        }
        let (_, next) = self.verifier_lists();
        let moved = self.psm.pick_next_verifiers_from_base(&next);
        let added = self.psm.add_current_verifiers_to_next(&next);
        debug!(moved, added, "matched current verifiers to next");
    }

    // =========================================================================
    // CONSENSUS MESSAGING
    // =========================================================================

    /// Send to every current-verifier peer. Failures are logged per peer.
    pub fn broadcast_msg(&self, code: u64, payload: Vec<u8>) {
        for peer in self.psm.current_verifiers().peer_list() {
            spawn_send(peer, Msg::new(code, payload.clone()));
        }
    }

    /// Send to the current or next verifier peers whose address is listed.
    pub fn broadcast_msg_to_target_verifiers(&self, code: u64, to: &[Address], payload: Vec<u8>) {
        let mut targets: HashMap<String, Arc<Peer>> = HashMap::new();
        for set in [self.psm.current_verifiers(), self.psm.next_verifiers()] {
            for peer in set.peer_list() {
                if to.contains(&peer.verifier_address()) {
                    targets.insert(peer.id().to_string(), peer);
                }
            }
        }
        for peer in targets.into_values() {
            spawn_send(peer, Msg::new(code, payload.clone()));
        }
    }

    /// Send to the verifier peer owning `address`.
    pub async fn send_fetch_block_msg(
        &self,
        code: u64,
        address: &Address,
        payload: Vec<u8>,
    ) -> Result<(), CommError> {
        let peer = self
            .psm
            .current_verifiers()
            .peer_by_verifier_address(address)
            .or_else(|| self.psm.next_verifiers().peer_by_verifier_address(address))
            .ok_or(CommError::NoVerifierPeerForFetcher)?;
        peer.send_msg(Msg::new(code, payload)).await?;
        Ok(())
    }

    pub fn show_pm_info(&self) -> CsPmPeerInfo {
        self.psm.info()
    }
}

fn spawn_send(peer: Arc<Peer>, msg: Msg) {
    tokio::spawn(async move {
        if let Err(e) = peer.send_msg(msg).await {
            warn!(peer = %peer.id(), error = %e, "consensus message send failed");
        }
    });
}

// =============================================================================
// PORT IMPLEMENTATIONS
// =============================================================================

impl VerifierClassifier for CsPeerManager {
    fn is_current_verifier(&self, peer: &Peer) -> bool {
        self.is_current_address(&peer.verifier_address())
    }

    fn is_next_verifier(&self, peer: &Peer) -> bool {
        self.is_next_address(&peer.verifier_address())
    }

    fn is_verifier_boot(&self, peer: &Peer) -> bool {
        self.verifier_boot_ids.contains(peer.id())
    }

    fn self_is_current_verifier(&self) -> bool {
        self.is_current_address(&self.self_address)
    }

    fn self_is_next_verifier(&self) -> bool {
        self.is_next_address(&self.self_address)
    }
}

impl PeerManager for CsPeerManager {
    fn get_peers(&self) -> HashMap<String, Arc<Peer>> {
        self.psm.get_peers()
    }

    fn best_peer(&self) -> Option<Arc<Peer>> {
        self.psm.best_peer()
    }

    fn get_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.psm.get_peer(id)
    }

    fn remove_peer(&self, id: &str) {
        if self.psm.remove_peer(id).is_some() {
            debug!(peer = %id, "peer removed");
        }
    }

    fn is_sync(&self) -> bool {
        let Some(best) = self.psm.best_peer() else {
            return false;
        };
        let local = self.chain.current_block().number();
        local + SYNC_HEIGHT_SLACK < best.head().height
    }
}

impl AbsPeerManager for CsPeerManager {
    fn self_role(&self) -> SelfRole {
        self.psm.self_role()
    }

    fn self_is_current_verifier(&self) -> bool {
        VerifierClassifier::self_is_current_verifier(self)
    }

    fn self_is_next_verifier(&self) -> bool {
        VerifierClassifier::self_is_next_verifier(self)
    }

    fn have_enough_verifiers(&self, with_organize: bool) -> (usize, usize) {
        let expected = self.expected_verifier_peers();
        let short = |psm: &PeerSetManager| {
            psm.current_verifiers().len() < expected || psm.next_verifiers().len() < expected
        };

        if with_organize && short(&self.psm) {
            let (current, next) = self.verifier_lists();
            self.psm.organize_verifiers_set(&current, &next);
        }

        (
            expected.saturating_sub(self.psm.current_verifiers().len()),
            expected.saturating_sub(self.psm.next_verifiers().len()),
        )
    }

    fn current_verifier_peers(&self) -> Vec<Arc<Peer>> {
        self.psm.current_verifiers().peer_list()
    }

    fn next_verifier_peers(&self) -> Vec<Arc<Peer>> {
        self.psm.next_verifiers().peer_list()
    }

    fn verifier_boot_peers(&self) -> Vec<Arc<Peer>> {
        self.psm.verifier_boots().peer_list()
    }
}
