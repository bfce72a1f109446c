//! # Node Harness
//!
//! Builds full chain-communication stacks through
//! [`make_cs_protocol_manager`] and wires them together with
//! [`MockConnection`] pairs. Every node runs the real handshake, dispatch
//! and background loops; only the chain store, pools, consensus engine and
//! p2p server are in-memory doubles.

pub mod peer_graph;
pub mod sync_flows;

use std::sync::Arc;
use std::time::Duration;

use qc_05_chain_communication::test_utils::{
    wait_until, MemoryChain, MockConnection, MockConsensus, MockP2P, MockTxPool, StaticVerifiers,
    TestNode,
};
use qc_05_chain_communication::{
    make_cs_protocol_manager, make_status, BroadcastDelegate, ChainCommConfig, ChainCommDeps,
    CommError, CsProtocolManager, FetcherHandle, HandShakeData, LocalSigner, Msg, NodeSigner,
    Peer, PeerConnection, PeerManager, STATUS_MSG,
};
use shared_types::{Address, NodeType};
use tokio::task::JoinHandle;

// =============================================================================
// NODES
// =============================================================================

/// Everything needed to build one node.
pub struct NodeSetup {
    pub id: &'static str,
    pub node_type: NodeType,
    pub chain: MemoryChain,
    pub verifiers: Arc<StaticVerifiers>,
    pub verifier_boots: Vec<&'static str>,
    pub verifier_number: usize,
    /// Secret key byte; required for every type but `Normal`.
    pub key: Option<u8>,
}

impl NodeSetup {
    pub fn normal(id: &'static str, chain: MemoryChain) -> Self {
        Self {
            id,
            node_type: NodeType::Normal,
            chain,
            verifiers: Arc::new(StaticVerifiers::default()),
            verifier_boots: Vec::new(),
            verifier_number: 4,
            key: None,
        }
    }

    pub fn build(self) -> Node {
        let mut config = ChainCommConfig::for_testing();
        config.node.node_type = self.node_type;
        config.node.node_name = format!("node-{}", self.id);
        config.node.node_url = TestNode::new(self.id).url().to_string();
        config.chain.verifier_number = self.verifier_number;
        config.verifier_boot_nodes = self
            .verifier_boots
            .iter()
            .map(|id| TestNode::new(id).url().to_string())
            .collect();

        let signer = self.key.map(signer);
        let chain = Arc::new(self.chain);
        let consensus = Arc::new(MockConsensus::default());
        let pool = Arc::new(MockTxPool::default());
        let p2p = Arc::new(MockP2P::new(TestNode::new(self.id).url()));
        let deps = ChainCommDeps {
            chain: chain.clone(),
            verifiers: self.verifiers.clone(),
            consensus: consensus.clone(),
            tx_pool: pool.clone(),
            p2p: p2p.clone(),
            signer: signer.clone().map(|s| s as Arc<dyn NodeSigner>),
        };
        let (manager, delegate, fetcher) =
            make_cs_protocol_manager(Arc::new(config), deps).expect("node builds");
        manager.start().expect("node starts");

        Node {
            id: self.id,
            manager,
            delegate,
            fetcher,
            chain,
            consensus,
            pool,
            p2p,
            signer,
        }
    }
}

pub fn signer(key: u8) -> Arc<LocalSigner> {
    Arc::new(LocalSigner::from_bytes(&[key; 32]).expect("valid key"))
}

pub fn address_of(key: u8) -> Address {
    signer(key).address()
}

pub struct Node {
    pub id: &'static str,
    pub manager: Arc<CsProtocolManager>,
    pub delegate: BroadcastDelegate,
    pub fetcher: FetcherHandle,
    pub chain: Arc<MemoryChain>,
    pub consensus: Arc<MockConsensus>,
    pub pool: Arc<MockTxPool>,
    pub p2p: Arc<MockP2P>,
    pub signer: Option<Arc<LocalSigner>>,
}

impl Node {
    pub fn has_peer(&self, id: &str) -> bool {
        self.manager.core().get_peer(id).is_some()
    }

    /// Ids this node asked its p2p server to dial, deduplicated and sorted.
    pub fn dialed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .p2p
            .added()
            .iter()
            .map(|u| u.id().to_string())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.manager.stop();
    }
}

/// Link two nodes and wait until both admitted each other.
pub async fn connect(a: &Node, b: &Node) {
    let (a_end, b_end) = MockConnection::pair();
    let peer_b = Arc::new(Peer::new(b.id, 1, a_end));
    let peer_a = Arc::new(Peer::new(a.id, 1, b_end));

    let manager = a.manager.clone();
    tokio::spawn(async move { manager.handle(peer_b).await });
    let manager = b.manager.clone();
    tokio::spawn(async move { manager.handle(peer_a).await });

    assert!(
        wait_until(|| a.has_peer(b.id) && b.has_peer(a.id)).await,
        "{} and {} never finished the handshake",
        a.id,
        b.id
    );
}

// =============================================================================
// SCRIPTED REMOTES
// =============================================================================

/// A remote end driven by the test instead of a protocol manager.
pub struct ScriptedRemote {
    pub conn: Arc<MockConnection>,
    pub task: JoinHandle<Result<(), CommError>>,
}

/// Handshake data a remote compatible with `node` would send.
pub fn remote_handshake(node: &Node, remote_id: &str, node_type: NodeType) -> HandShakeData {
    let mut handshake = node.manager.local_handshake_data();
    handshake.node_type = node_type.as_u64();
    handshake.node_name = format!("remote-{remote_id}");
    handshake.raw_url = TestNode::new(remote_id).url().to_string();
    handshake
}

/// Hand `node` a new connection whose remote sends `handshake`, signed by
/// `key` when given.
pub async fn attach_scripted(
    node: &Node,
    remote_id: &str,
    handshake: HandShakeData,
    key: Option<u8>,
) -> ScriptedRemote {
    let node_type = NodeType::try_from(handshake.node_type).expect("valid node type");
    let signer = key.map(signer);
    let status = make_status(
        handshake,
        node_type,
        signer.as_deref().map(|s| s as &dyn NodeSigner),
    )
    .expect("status builds");

    let (local, conn) = MockConnection::pair();
    conn.write_msg(Msg::encode(STATUS_MSG, &status))
        .await
        .expect("status written");

    let peer = Arc::new(Peer::new(remote_id.to_string(), 1, local));
    let manager = node.manager.clone();
    let task = tokio::spawn(async move { manager.handle(peer).await });
    ScriptedRemote { conn, task }
}

/// Read from `conn` until a message with `code` arrives.
pub async fn read_until(conn: &MockConnection, code: u64) -> Msg {
    let wait = async {
        loop {
            let msg = conn.read_msg().await.expect("connection open");
            if msg.code == code {
                return msg;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no message with code {code:#x}"))
}
