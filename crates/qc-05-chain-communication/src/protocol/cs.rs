//! # Cs Protocol Manager
//!
//! Owns the chain-sync protocol: handshake, per-peer read loop, message
//! dispatch and the background loops that keep the verifier peer graph in
//! shape.
//!
//! ## Read Loop
//!
//! ```text
//! capacity check → handshake → duplicate verifier check → admit
//!       → loop { read, size check, route } → remove from every set
//! ```
//!
//! Codes at or above `0x100` go to the consensus engine unless the local
//! node is a base node, in which case they are dropped with a warning.
//! Broken errors end the loop; anything else is logged and the loop pauses
//! for a few milliseconds.
//!
//! ## Background Loops
//!
//! | Loop | Period | Roles |
//! |------|--------|-------|
//! | Block-insert events | per committed block | all |
//! | Verifier-boot reconnect | 8 s | verifier, boot |
//! | Peer health log | 15 s | all |

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use shared_types::{Block, NodeType, ZERO_HASH};
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::base::{check_msg_size, BaseProtocolManager};
use super::peer_manager::CsPeerManager;
use super::Protocol;
use crate::config::{CS_PROTOCOL_LENGTH, CS_PROTOCOL_VERSION};
use crate::domain::{
    make_status, recover_sender, verify_remote_status, CommError, DisconnectReason,
    HandShakeData, Msg, NodeUrl, Peer, SelfRole, StatusData, STATUS_MSG,
};
use crate::ports::{
    AbsPeerManager, CommunicationExecutable, CommunicationService, NodeSigner, P2PServer,
    PeerManager, PeerObserver,
};
use crate::verifier_finder::VerifierFinder;

/// Pause after a non-broken handler error.
const HANDLE_ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub struct CsProtocolManager {
    base: BaseProtocolManager,
    core: Arc<CsPeerManager>,
    p2p: Arc<dyn P2PServer>,
    signer: Option<Arc<dyn NodeSigner>>,
    observers: RwLock<Vec<Arc<dyn PeerObserver>>>,
    verifier_finder: RwLock<Option<Arc<VerifierFinder>>>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl CsProtocolManager {
    pub fn new(
        core: Arc<CsPeerManager>,
        p2p: Arc<dyn P2PServer>,
        signer: Option<Arc<dyn NodeSigner>>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            base: BaseProtocolManager::new(),
            core,
            p2p,
            signer,
            observers: RwLock::new(Vec::new()),
            verifier_finder: RwLock::new(None),
            started: AtomicBool::new(false),
            stop_tx,
        }
    }

    pub fn core(&self) -> &Arc<CsPeerManager> {
        &self.core
    }

    pub fn register_communication_service(
        &self,
        service: Arc<dyn CommunicationService>,
        executable: Option<Arc<dyn CommunicationExecutable>>,
    ) -> Result<(), CommError> {
        self.base.register_communication_service(service, executable)
    }

    pub fn register_executable(&self, executable: Arc<dyn CommunicationExecutable>) {
        self.base.register_executable(executable);
    }

    pub fn has_handler(&self, code: u64) -> bool {
        self.base.has_handler(code)
    }

    pub fn register_peer_observer(&self, observer: Arc<dyn PeerObserver>) {
        self.observers.write().push(observer);
    }

    /// Finder triggered by block-insert events.
    pub fn set_verifier_finder(&self, finder: Arc<VerifierFinder>) {
        *self.verifier_finder.write() = Some(finder);
    }

    pub fn protocols(&self) -> Vec<Protocol> {
        vec![Protocol {
            name: self.core.config().cs_protocol_name().to_string(),
            version: CS_PROTOCOL_VERSION,
            length: CS_PROTOCOL_LENGTH,
        }]
    }

    // =========================================================================
    // PEER LIFECYCLE
    // =========================================================================

    /// Run one connection to completion.
    ///
    /// Returns once the peer is gone or the manager stops. The peer is
    /// disconnected before returning an error.
    pub async fn handle(&self, peer: Arc<Peer>) -> Result<(), CommError> {
        if self.core.psm().check_conn_count() {
            warn!(peer = %peer.id(), "too many peers, refusing connection");
            peer.disconnect(DisconnectReason::TooManyPeers);
            return Err(CommError::TooManyPeers);
        }

        if let Err(e) = self.admit(&peer).await {
            warn!(peer = %peer.id(), remote = %peer.remote_addr(), error = %e, "peer admission failed");
            let reason = match e {
                CommError::TooManyPeers => DisconnectReason::TooManyPeers,
                CommError::AlreadyPresent(_)
                | CommError::DuplicateCurrentVerifierAddress
                | CommError::DuplicateNextVerifierAddress => DisconnectReason::AlreadyConnected,
                _ => DisconnectReason::ProtocolError,
            };
            peer.disconnect(reason);
            return Err(e);
        }

        for observer in self.observers.read().iter() {
            observer.on_new_peer(peer.clone());
        }

        let result = self.read_loop(&peer).await;
        self.core.remove_peer(peer.id());
        result
    }

    async fn admit(&self, peer: &Arc<Peer>) -> Result<(), CommError> {
        self.handshake(peer).await?;
        self.core.check_duplicate_verifier(peer)?;
        let joined = self.core.add_peer(peer.clone())?;
        info!(
            peer = %peer.id(),
            name = %peer.node_name(),
            node_type = ?peer.node_type(),
            sets = ?joined,
            "peer connected"
        );
        Ok(())
    }

    async fn read_loop(&self, peer: &Arc<Peer>) -> Result<(), CommError> {
        let mut stop = self.stop_tx.subscribe();
        loop {
            let result = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                result = self.handle_msg(peer) => result,
            };

            let Err(e) = result else { continue };
            if e.is_broken() {
                debug!(peer = %peer.id(), error = %e, "peer connection broken");
                peer.set_not_running();
                return Err(e);
            }
            warn!(peer = %peer.id(), error = %e, "handle peer msg failed");
            tokio::time::sleep(HANDLE_ERROR_BACKOFF).await;
        }
    }

    /// Read and route one message.
    pub async fn handle_msg(&self, peer: &Arc<Peer>) -> Result<(), CommError> {
        let msg = peer.read_msg().await?;
        check_msg_size(&msg)?;

        if msg.is_consensus() {
            if self.core.psm().self_role() == SelfRole::Base {
                warn!(
                    peer = %peer.id(),
                    code = msg.code,
                    "consensus message received by a non-verifier node, dropped"
                );
                return Ok(());
            }
            return self.core.consensus().on_new_p2p_msg(msg, peer.clone()).await;
        }

        self.base.dispatch(msg, peer.clone()).await
    }

    // =========================================================================
    // HANDSHAKE
    // =========================================================================

    /// Local half of the handshake.
    pub fn local_handshake_data(&self) -> HandShakeData {
        let config = self.core.config();
        let chain = self.core.chain();
        let current = chain.current_block();
        let genesis = chain
            .get_block_by_number(0)
            .map(|b| b.hash())
            .unwrap_or(ZERO_HASH);

        HandShakeData {
            protocol_version: config.chain.protocol_version,
            chain_id: config.chain.chain_id,
            network_id: config.chain.network_id,
            current_block: current.hash(),
            current_block_height: current.number(),
            genesis_block: genesis,
            node_type: config.node.node_type.as_u64(),
            node_name: config.node.node_name.clone(),
            raw_url: self.core.self_node().to_string(),
        }
    }

    /// Exchange status with `peer` and apply what it declares.
    pub async fn handshake(&self, peer: &Arc<Peer>) -> Result<(), CommError> {
        let local = self.local_handshake_data();
        let node_type = self.core.config().node.node_type;
        let status = make_status(local.clone(), node_type, self.signer.as_deref())?;

        let (sent, received) = tokio::time::timeout(
            self.core.config().sync.handshake_timeout(),
            async { tokio::join!(peer.send(STATUS_MSG, &status), read_status(peer)) },
        )
        .await
        .map_err(|_| CommError::HandshakeTimeout)?;
        sent?;
        let remote = received?;

        verify_remote_status(&local, &remote.handshake)?;

        let declared = &remote.handshake;
        peer.set_node_type(NodeType::try_from(declared.node_type)?);
        peer.set_node_name(declared.node_name.clone());
        peer.set_head(declared.current_block, declared.current_block_height);
        peer.set_raw_url(observed_raw_url(&declared.raw_url, peer));
        peer.set_verifier_address(recover_sender(&remote));

        info!(
            peer = %peer.id(),
            remote = %declared.node_name,
            height = declared.current_block_height,
            node_type = declared.node_type,
            raw_url = %peer.raw_url(),
            "cs protocol handshake success"
        );
        Ok(())
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start hosted services and the background loops.
    pub fn start(self: &Arc<Self>) -> Result<(), CommError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CommError::AlreadyStarted);
        }
        self.base.start_services()?;

        let inserted = self.core.chain().subscribe_inserted_blocks();
        tokio::spawn(self.clone().run_insert_events(inserted, self.stop_tx.subscribe()));
        tokio::spawn(self.clone().run_peer_health_log(self.stop_tx.subscribe()));

        let node_type = self.core.config().node.node_type;
        if matches!(node_type, NodeType::Verifier | NodeType::VerifierBoot) {
            tokio::spawn(
                self.clone()
                    .run_verifier_boot_reconnect(self.stop_tx.subscribe()),
            );
        }

        info!(
            role = self.core.psm().self_role().as_str(),
            protocol = %self.core.config().cs_protocol_name(),
            "cs protocol manager started"
        );
        Ok(())
    }

    /// Stop services and loops, then drop every peer.
    pub fn stop(&self) {
        self.base.stop_services();
        let _ = self.stop_tx.send(true);
        self.core.psm().close();
        info!("cs protocol manager stopped");
    }

    async fn run_insert_events(
        self: Arc<Self>,
        mut inserted: broadcast::Receiver<Block>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return,
                event = inserted.recv() => match event {
                    Ok(block) => self.on_block_inserted(&block),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "block insert events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("block insert event stream closed");
                        return;
                    }
                },
            }
        }
    }

    /// React to a committed block.
    pub fn on_block_inserted(&self, block: &Block) {
        let chain = self.core.chain();
        let slot = chain.get_slot(block).unwrap_or(0);

        if chain.is_change_point(block) && slot > 0 {
            if let Err(e) = self.core.change_verifiers() {
                warn!(height = block.number(), error = %e, "verifier rotation failed");
            }
        } else if self.core.self_is_current_verifier() || self.core.self_is_next_verifier() {
            if let Some(finder) = self.verifier_finder.read().clone() {
                tokio::spawn(async move {
                    match finder.find_verifiers().await {
                        Ok(()) => {}
                        Err(e) if e.is_find_precondition() => {
                            debug!(reason = %e, "verifier finding skipped");
                        }
                        Err(e) => warn!(error = %e, "verifier finding failed"),
                    }
                });
            }
        }

        if self.core.self_is_current_verifier() {
            self.core.consensus().on_enter_new_height(block.number() + 1);
        }
    }

    async fn run_verifier_boot_reconnect(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.core.config().sync.verifier_boot_reconnect());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return,
                _ = ticker.tick() => self.reconnect_verifier_boots(),
            }
        }
    }

    /// Dial configured verifier-boot nodes missing from the boot set.
    ///
    /// Only while the local chain is within two blocks of the best peer and
    /// the local node is a current or next verifier, or a boot node itself.
    pub fn reconnect_verifier_boots(&self) {
        let role = self.core.psm().self_role();
        if role == SelfRole::Base {
            return;
        }

        let Some(best) = self.core.best_peer() else {
            debug!("no best peer, skipping verifier-boot reconnect");
            return;
        };
        if self.core.chain().current_block().number() + 2 < best.head().height {
            return;
        }

        if !(self.core.self_is_current_verifier()
            || self.core.self_is_next_verifier()
            || role == SelfRole::Boot)
        {
            return;
        }

        let boots = self.core.psm().verifier_boots();
        let wanted = self
            .core
            .config()
            .chain
            .verifier_boot_node_number
            .saturating_sub(1);
        if boots.len() == wanted {
            return;
        }

        let self_id = self.core.self_node().id();
        for url in self.core.verifier_boot_urls() {
            if url.id() == self_id || boots.contains(url.id()) {
                continue;
            }
            info!(node = %url, "dialing verifier boot node");
            self.p2p.add_peer(url.clone());
        }
    }

    async fn run_peer_health_log(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.core.config().sync.peer_health_log());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return,
                _ = ticker.tick() => self.log_peer_health(),
            }
        }
    }

    pub fn log_peer_health(&self) {
        let psm = self.core.psm();
        info!(
            normal = psm.base().len(),
            cur_verifiers = psm.current_verifiers().len(),
            next_verifiers = psm.next_verifiers().len(),
            verifier_boots = psm.verifier_boots().len(),
            "peer sets"
        );
        debug!(
            base = ?psm.base().node_names(),
            current = ?psm.current_verifiers().node_names(),
            next = ?psm.next_verifiers().node_names(),
            boots = ?psm.verifier_boots().node_names(),
            "peer set members"
        );
    }
}

async fn read_status(peer: &Peer) -> Result<StatusData, CommError> {
    let msg = peer.read_msg().await?;
    if msg.code != STATUS_MSG {
        return Err(CommError::NoStatusMsg(msg.code));
    }
    check_msg_size(&msg)?;
    Ok(msg.decode::<StatusData>()?)
}

/// Declared contact URL with its host replaced by the observed socket IP.
fn observed_raw_url(declared: &str, peer: &Peer) -> String {
    match NodeUrl::parse(declared) {
        Ok(url) => url.with_host(peer.remote_addr().ip().to_string()).to_string(),
        Err(_) => declared.to_string(),
    }
}
