//! Test utilities for chain communication.
//!
//! In-memory doubles for every outbound port plus peer builders, so the
//! protocol managers and broadcasters can be driven without sockets or a
//! real chain store. Enable with the `test-utils` feature flag.
//!
//! # Example
//!
//! ```ignore
//! use qc_05_chain_communication::test_utils::{MemoryChain, MockConnection};
//! use qc_05_chain_communication::ChainReader;
//!
//! let chain = MemoryChain::new(3);
//! assert_eq!(chain.current_block().number(), 3);
//!
//! let (local, remote) = MockConnection::pair();
//! assert!(!local.is_closed() && !remote.is_closed());
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::{
    Address, Block, BlockHeader, CatchupBundle, Hash, NodeType, Transaction, Verification,
    ZERO_HASH,
};
use tokio::sync::{broadcast, Notify};

use crate::config::ChainCommConfig;
use crate::domain::{
    ChainError, CommError, DisconnectReason, Msg, NodeUrl, Peer, SelfRole, TransportError,
    TxRejected, VerifierClassifier,
};
use crate::ports::{
    BlockImportObserver, ChainReader, ConsensusEngine, FetchRequest, MineMsgHandler, P2PServer,
    PeerConnection, PeerManager, TxPool, VerifiersReader,
};
use crate::protocol::CsPeerManager;

// =============================================================================
// CONNECTIONS AND PEERS
// =============================================================================

#[derive(Default)]
struct Inbox {
    queue: Mutex<VecDeque<Msg>>,
    notify: Notify,
}

/// One end of an in-memory duplex link.
///
/// Writes land in the other end's inbox. Disconnecting either end closes
/// both; queued messages can still be read after that.
pub struct MockConnection {
    addr: SocketAddr,
    inbox: Arc<Inbox>,
    outbox: Arc<Inbox>,
    closed: Arc<AtomicBool>,
    write_error: Mutex<Option<TransportError>>,
}

impl MockConnection {
    pub fn pair() -> (Arc<MockConnection>, Arc<MockConnection>) {
        Self::pair_with_addr(SocketAddr::from(([127, 0, 0, 1], 30303)))
    }

    /// Pair whose first end reports `addr` as the remote address.
    pub fn pair_with_addr(addr: SocketAddr) -> (Arc<MockConnection>, Arc<MockConnection>) {
        let a = Arc::new(Inbox::default());
        let b = Arc::new(Inbox::default());
        let closed = Arc::new(AtomicBool::new(false));
        let local = Arc::new(MockConnection {
            addr,
            inbox: a.clone(),
            outbox: b.clone(),
            closed: closed.clone(),
            write_error: Mutex::new(None),
        });
        let remote = Arc::new(MockConnection {
            addr: SocketAddr::from(([127, 0, 0, 1], 30304)),
            inbox: b,
            outbox: a,
            closed,
            write_error: Mutex::new(None),
        });
        (local, remote)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pop the next queued message without waiting.
    pub fn try_read_msg(&self) -> Option<Msg> {
        self.inbox.queue.lock().pop_front()
    }

    /// Make every following write on this end fail with `err`.
    pub fn fail_writes_with(&self, err: TransportError) {
        *self.write_error.lock() = Some(err);
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn read_msg(&self) -> Result<Msg, TransportError> {
        loop {
            let notified = self.inbox.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(msg) = self.try_read_msg() {
                return Ok(msg);
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            notified.await;
        }
    }

    async fn write_msg(&self, msg: Msg) -> Result<(), TransportError> {
        if let Some(err) = self.write_error.lock().clone() {
            return Err(err);
        }
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbox.queue.lock().push_back(msg);
        self.outbox.notify.notify_one();
        Ok(())
    }

    fn disconnect(&self, _reason: DisconnectReason) {
        self.closed.store(true, Ordering::SeqCst);
        self.inbox.notify.notify_waiters();
        self.outbox.notify.notify_waiters();
    }
}

/// Untyped peer whose head sits at `height`.
pub fn test_peer(id: &str, height: u64) -> Arc<Peer> {
    let (conn, _remote) = MockConnection::pair();
    let peer = Arc::new(Peer::new(id, 1, conn));
    peer.set_node_name(id);
    peer.set_head([1u8; 32], height);
    peer
}

pub fn typed_peer(id: &str, node_type: NodeType, address: Address) -> Arc<Peer> {
    let (conn, _remote) = MockConnection::pair();
    typed_peer_with_conn(id, node_type, address, conn)
}

pub fn typed_peer_with_conn(
    id: &str,
    node_type: NodeType,
    address: Address,
    conn: Arc<MockConnection>,
) -> Arc<Peer> {
    let peer = Arc::new(Peer::new(id, 1, conn));
    peer.set_node_name(id);
    peer.set_node_type(node_type);
    peer.set_verifier_address(address);
    peer
}

/// Node URL on localhost for a hex node id.
pub struct TestNode {
    id: String,
}

impl TestNode {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    pub fn url(&self) -> NodeUrl {
        NodeUrl::new(self.id.clone(), "127.0.0.1", 30303)
    }
}

/// Poll `cond` every 10ms for up to three seconds.
pub async fn wait_until(cond: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// =============================================================================
// PEER MANAGERS
// =============================================================================

/// Classifier answering from fixed address and id lists.
#[derive(Debug, Clone, Default)]
pub struct StaticClassifier {
    pub current: Vec<Address>,
    pub next: Vec<Address>,
    pub boots: Vec<String>,
    pub self_current: bool,
    pub self_next: bool,
}

impl VerifierClassifier for StaticClassifier {
    fn is_current_verifier(&self, peer: &Peer) -> bool {
        self.current.contains(&peer.verifier_address())
    }

    fn is_next_verifier(&self, peer: &Peer) -> bool {
        self.next.contains(&peer.verifier_address())
    }

    fn is_verifier_boot(&self, peer: &Peer) -> bool {
        self.boots.iter().any(|id| id == peer.id())
    }

    fn self_is_current_verifier(&self) -> bool {
        self.self_current
    }

    fn self_is_next_verifier(&self) -> bool {
        self.self_next
    }
}

/// Flat peer manager over a fixed peer list. Removals are recorded.
pub struct StaticPeers {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    removed: Mutex<Vec<String>>,
}

impl StaticPeers {
    pub fn new(peers: Vec<Arc<Peer>>) -> Self {
        Self {
            peers: RwLock::new(peers.into_iter().map(|p| (p.id().to_string(), p)).collect()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().clone()
    }
}

impl PeerManager for StaticPeers {
    fn get_peers(&self) -> HashMap<String, Arc<Peer>> {
        self.peers.read().clone()
    }

    fn best_peer(&self) -> Option<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .max_by_key(|p| p.head().height)
            .cloned()
    }

    fn get_peer(&self, id: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(id).cloned()
    }

    fn remove_peer(&self, id: &str) {
        self.removed.lock().push(id.to_string());
        self.peers.write().remove(id);
    }

    fn is_sync(&self) -> bool {
        false
    }
}

// =============================================================================
// CHAIN
// =============================================================================

const GENESIS_TIME: u64 = 1_600_000_000;

fn chain_block(number: u64, parent_hash: Hash) -> Block {
    let mut header = BlockHeader::new(number, parent_hash);
    header.timestamp = GENESIS_TIME + number;
    Block::new(header, Vec::new())
}

fn commits_for(block: &Block) -> Vec<Verification> {
    vec![Verification {
        height: block.number(),
        block_hash: block.hash(),
        signer: [0xc0; 20],
        ..Default::default()
    }]
}

/// Stand-alone bundle at `number`; parents do not link up.
pub fn test_bundle(number: u64) -> CatchupBundle {
    let block = chain_block(number, ZERO_HASH);
    let commits = commits_for(&block);
    CatchupBundle::new(block, commits)
}

#[derive(Clone, Default)]
struct ChainState {
    blocks: Vec<Block>,
    commits: HashMap<u64, Vec<Verification>>,
    slots: HashMap<u64, u64>,
    change_points: HashSet<u64>,
    saved: Vec<u64>,
}

impl ChainState {
    fn current(&self) -> &Block {
        // Construction always inserts genesis.
        &self.blocks[self.blocks.len() - 1]
    }

    fn next_block(&self) -> Block {
        let head = self.current();
        chain_block(head.number() + 1, head.hash())
    }

    fn append(&mut self, block: Block, commits: Vec<Verification>) {
        self.commits.insert(block.number(), commits);
        self.blocks.push(block);
    }
}

/// Deterministic in-memory chain store.
///
/// Two chains built to the same height hold identical blocks, so one can
/// serve as the remote copy of another.
pub struct MemoryChain {
    state: Mutex<ChainState>,
    inserted: broadcast::Sender<Block>,
}

impl MemoryChain {
    /// Chain holding blocks `0..=height`, each with its seen commits.
    pub fn new(height: u64) -> Self {
        let mut state = ChainState::default();
        let genesis = chain_block(0, ZERO_HASH);
        let commits = commits_for(&genesis);
        state.append(genesis, commits);
        for _ in 0..height {
            let block = state.next_block();
            let commits = commits_for(&block);
            state.append(block, commits);
        }
        Self::from_state(state)
    }

    /// Copy of `base` with `extra` more blocks on top.
    pub fn extending(base: &MemoryChain, extra: u64) -> Self {
        let mut state = base.state.lock().clone();
        state.saved.clear();
        for _ in 0..extra {
            let block = state.next_block();
            let commits = commits_for(&block);
            state.append(block, commits);
        }
        Self::from_state(state)
    }

    fn from_state(state: ChainState) -> Self {
        let (inserted, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(state),
            inserted,
        }
    }

    /// Commit the next block and announce it to subscribers.
    pub fn push_block(&self) -> Block {
        let block = {
            let mut state = self.state.lock();
            let block = state.next_block();
            let commits = commits_for(&block);
            state.append(block.clone(), commits);
            block
        };
        let _ = self.inserted.send(block.clone());
        block
    }

    /// The block that would come next, not committed.
    pub fn next_block(&self) -> Block {
        self.state.lock().next_block()
    }

    pub fn next_bundle(&self) -> CatchupBundle {
        let block = self.next_block();
        let commits = commits_for(&block);
        CatchupBundle::new(block, commits)
    }

    /// Stored bundle at `number`. Panics when the height is missing.
    pub fn bundle_at(&self, number: u64) -> CatchupBundle {
        let state = self.state.lock();
        let block = state
            .blocks
            .get(number as usize)
            .cloned()
            .unwrap_or_else(|| panic!("no block at height {number}"));
        let commits = state.commits.get(&number).cloned().unwrap_or_default();
        CatchupBundle::new(block, commits)
    }

    pub fn set_slot(&self, number: u64, slot: u64) {
        self.state.lock().slots.insert(number, slot);
    }

    pub fn mark_change_point(&self, number: u64, slot: u64) {
        let mut state = self.state.lock();
        state.change_points.insert(number);
        state.slots.insert(number, slot);
    }

    /// Heights accepted through `save_block`, in order.
    pub fn saved(&self) -> Vec<u64> {
        self.state.lock().saved.clone()
    }
}

impl ChainReader for MemoryChain {
    fn current_block(&self) -> Block {
        self.state.lock().current().clone()
    }

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block> {
        self.state
            .lock()
            .blocks
            .iter()
            .find(|b| &b.hash() == hash)
            .cloned()
    }

    fn get_block_by_number(&self, number: u64) -> Option<Block> {
        self.state.lock().blocks.get(number as usize).cloned()
    }

    fn get_seen_commits(&self, height: u64) -> Option<Vec<Verification>> {
        self.state.lock().commits.get(&height).cloned()
    }

    fn get_slot(&self, block: &Block) -> Option<u64> {
        Some(
            self.state
                .lock()
                .slots
                .get(&block.number())
                .copied()
                .unwrap_or(0),
        )
    }

    fn is_change_point(&self, block: &Block) -> bool {
        self.state.lock().change_points.contains(&block.number())
    }

    fn save_block(&self, block: &Block, seen_commits: &[Verification]) -> Result<(), ChainError> {
        {
            let mut state = self.state.lock();
            let head = state.current();
            let height = block.number();
            if height <= head.number() {
                return Err(ChainError::HeightIsCurrentAndNotSpecial { height });
            }
            if height != head.number() + 1 || block.parent_hash() != head.hash() {
                return Err(ChainError::ParentNotFound { height });
            }
            state.append(block.clone(), seen_commits.to_vec());
            state.saved.push(height);
        }
        let _ = self.inserted.send(block.clone());
        Ok(())
    }

    fn subscribe_inserted_blocks(&self) -> broadcast::Receiver<Block> {
        self.inserted.subscribe()
    }
}

/// Verifier lists that tests rewrite at will.
#[derive(Default)]
pub struct StaticVerifiers {
    current: RwLock<Vec<Address>>,
    next: RwLock<Vec<Address>>,
    should_change: AtomicBool,
}

impl StaticVerifiers {
    pub fn new(current: Vec<Address>, next: Vec<Address>) -> Self {
        Self {
            current: RwLock::new(current),
            next: RwLock::new(next),
            should_change: AtomicBool::new(false),
        }
    }

    pub fn set_current(&self, current: Vec<Address>) {
        *self.current.write() = current;
    }

    pub fn set_next(&self, next: Vec<Address>) {
        *self.next.write() = next;
    }

    pub fn set_should_change(&self, value: bool) {
        self.should_change.store(value, Ordering::SeqCst);
    }
}

impl VerifiersReader for StaticVerifiers {
    fn current_verifiers(&self) -> Vec<Address> {
        self.current.read().clone()
    }

    fn next_verifiers(&self) -> Vec<Address> {
        self.next.read().clone()
    }

    fn should_change_current(&self) -> bool {
        self.should_change.load(Ordering::SeqCst)
    }
}

// =============================================================================
// CONSENSUS, POOLS AND HANDLERS
// =============================================================================

/// Records every call made into the consensus engine.
#[derive(Default)]
pub struct MockConsensus {
    wait_verify: Mutex<Vec<(u64, String)>>,
    p2p_msgs: Mutex<Vec<u64>>,
    primaries: Mutex<Vec<Address>>,
    heights: Mutex<Vec<u64>>,
}

impl MockConsensus {
    /// `(height, sender id)` of every block handed over for verification.
    pub fn wait_verify_blocks(&self) -> Vec<(u64, String)> {
        self.wait_verify.lock().clone()
    }

    pub fn p2p_msgs(&self) -> Vec<u64> {
        self.p2p_msgs.lock().clone()
    }

    pub fn primaries(&self) -> Vec<Address> {
        self.primaries.lock().clone()
    }

    pub fn heights(&self) -> Vec<u64> {
        self.heights.lock().clone()
    }
}

#[async_trait]
impl ConsensusEngine for MockConsensus {
    fn on_new_wait_verify_block(&self, block: Block, peer_id: &str) {
        self.wait_verify
            .lock()
            .push((block.number(), peer_id.to_string()));
    }

    async fn on_new_p2p_msg(&self, msg: Msg, _peer: Arc<Peer>) -> Result<(), CommError> {
        self.p2p_msgs.lock().push(msg.code);
        Ok(())
    }

    fn change_primary(&self, primary: Address) {
        self.primaries.lock().push(primary);
    }

    fn on_enter_new_height(&self, height: u64) {
        self.heights.lock().push(height);
    }
}

/// P2P server that records dial and drop requests.
pub struct MockP2P {
    self_node: NodeUrl,
    added: Mutex<Vec<NodeUrl>>,
    removed: Mutex<Vec<NodeUrl>>,
}

impl MockP2P {
    pub fn new(self_node: NodeUrl) -> Self {
        Self {
            self_node,
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    pub fn added(&self) -> Vec<NodeUrl> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<NodeUrl> {
        self.removed.lock().clone()
    }
}

impl P2PServer for MockP2P {
    fn self_node(&self) -> NodeUrl {
        self.self_node.clone()
    }

    fn add_peer(&self, node: NodeUrl) {
        self.added.lock().push(node);
    }

    fn remove_peer(&self, node: &NodeUrl) {
        self.removed.lock().push(node.clone());
    }
}

/// Pool that accepts (or rejects) everything and serves a fixed pending set.
#[derive(Default)]
pub struct MockTxPool {
    reject: bool,
    added: Mutex<Vec<Transaction>>,
    pending: Mutex<Vec<Transaction>>,
}

impl MockTxPool {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Default::default()
        }
    }

    pub fn added(&self) -> Vec<Transaction> {
        self.added.lock().clone()
    }

    pub fn set_pending(&self, txs: Vec<Transaction>) {
        *self.pending.lock() = txs;
    }
}

impl TxPool for MockTxPool {
    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), TxRejected>> {
        if self.reject {
            return txs
                .iter()
                .map(|_| Err(TxRejected("pool full".to_string())))
                .collect();
        }
        let results = txs.iter().map(|_| Ok(())).collect();
        self.added.lock().extend(txs);
        results
    }

    fn pending(&self) -> HashMap<Address, Vec<Transaction>> {
        let mut grouped: HashMap<Address, Vec<Transaction>> = HashMap::new();
        for tx in self.pending.lock().iter() {
            grouped.entry(tx.from).or_default().push(tx.clone());
        }
        grouped
    }
}

/// Miner-side handler that records message codes.
#[derive(Default)]
pub struct MockMineHandler {
    fail: bool,
    received: Mutex<Vec<u64>>,
    master: Mutex<Option<String>>,
}

impl MockMineHandler {
    /// Handler that errors on every message.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn received(&self) -> Vec<u64> {
        self.received.lock().clone()
    }

    /// Id of the current mine master peer.
    pub fn master(&self) -> Option<String> {
        self.master.lock().clone()
    }
}

#[async_trait]
impl MineMsgHandler for MockMineHandler {
    fn set_mine_master_peer(&self, peer: Arc<Peer>) {
        *self.master.lock() = Some(peer.id().to_string());
    }

    async fn on_new_msg(&self, msg: Msg, _peer: Arc<Peer>) -> Result<(), CommError> {
        if self.fail {
            return Err(CommError::Stopped);
        }
        self.received.lock().push(msg.code);
        Ok(())
    }
}

// =============================================================================
// FETCHER HOOKS
// =============================================================================

pub struct NoopRequest;

#[async_trait]
impl FetchRequest for NoopRequest {
    async fn request(&self) -> Result<(), CommError> {
        Ok(())
    }
}

/// Fetch request that counts how often it was issued.
#[derive(Default)]
pub struct CountingRequest {
    calls: AtomicUsize,
}

impl CountingRequest {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchRequest for CountingRequest {
    async fn request(&self) -> Result<(), CommError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct ImportRecorder {
    bundles: Mutex<Vec<CatchupBundle>>,
}

impl ImportRecorder {
    pub fn bundles(&self) -> Vec<CatchupBundle> {
        self.bundles.lock().clone()
    }
}

impl BlockImportObserver for ImportRecorder {
    fn on_block_imported(&self, bundle: CatchupBundle) {
        self.bundles.lock().push(bundle);
    }
}

// =============================================================================
// CORE FIXTURE
// =============================================================================

/// A `CsPeerManager` wired to in-memory collaborators.
///
/// The local node is `aa00`; the chain starts at height 10.
pub struct CoreFixture {
    pub core: Arc<CsPeerManager>,
    pub chain: Arc<MemoryChain>,
    pub verifiers: Arc<StaticVerifiers>,
    pub consensus: Arc<MockConsensus>,
    pub p2p: Arc<MockP2P>,
    pub self_node: NodeUrl,
}

impl CoreFixture {
    pub fn new(
        role: SelfRole,
        self_address: Address,
        verifier_number: usize,
        boot_ids: &[&str],
    ) -> Self {
        let mut config = ChainCommConfig::for_testing();
        config.chain.verifier_number = verifier_number;
        config.node.node_type = match role {
            SelfRole::Base => NodeType::Normal,
            SelfRole::Verifier => NodeType::Verifier,
            SelfRole::Boot => NodeType::VerifierBoot,
        };

        let chain = Arc::new(MemoryChain::new(10));
        let verifiers = Arc::new(StaticVerifiers::default());
        let consensus = Arc::new(MockConsensus::default());
        let self_node = TestNode::new("aa00").url();
        let p2p = Arc::new(MockP2P::new(self_node.clone()));
        let boots = boot_ids.iter().map(|id| TestNode::new(id).url()).collect();

        let core = Arc::new(CsPeerManager::new(
            Arc::new(config),
            role,
            self_node.clone(),
            self_address,
            boots,
            chain.clone(),
            verifiers.clone(),
            consensus.clone(),
        ));
        Self {
            core,
            chain,
            verifiers,
            consensus,
            p2p,
            self_node,
        }
    }
}
