//! # Builder
//!
//! Wires the cs protocol manager and every service it hosts from a
//! configuration and the external ports.
//!
//! | Service | Roles |
//! |---------|-------|
//! | Tx broadcaster (+ pool sync observer) | all |
//! | Block broadcaster | all |
//! | Verified-block broadcaster | all |
//! | Block fetcher | all |
//! | Downloader | all |
//! | Verifier finder | verifier |
//! | Verifier-boot service | boot |

use std::sync::Arc;

use anyhow::Context;
use shared_types::{to_hex, Block, CatchupBundle, Transaction, ZERO_ADDRESS};
use tracing::{info, warn};

use crate::broadcast::{BlockBroadcaster, TxBroadcaster, VerifiedBlockBroadcaster};
use crate::config::ChainCommConfig;
use crate::domain::SelfRole;
use crate::downloader::Downloader;
use crate::fetcher::{BlockFetcher, FetcherHandle};
use crate::ports::{
    ChainReader, ConsensusEngine, NodeSigner, P2PServer, PeerManager, TxPool, VerifiersReader,
};
use crate::protocol::{CsPeerManager, CsProtocolManager};
use crate::verifier_boot::VerifierBootService;
use crate::verifier_finder::VerifierFinder;

/// External collaborators of the chain-communication core.
#[derive(Clone)]
pub struct ChainCommDeps {
    pub chain: Arc<dyn ChainReader>,
    pub verifiers: Arc<dyn VerifiersReader>,
    pub consensus: Arc<dyn ConsensusEngine>,
    pub tx_pool: Arc<dyn TxPool>,
    pub p2p: Arc<dyn P2PServer>,
    /// Node key. Required for verifier and boot nodes to sign handshakes.
    pub signer: Option<Arc<dyn NodeSigner>>,
}

/// Broadcast entry points for the rest of the node.
#[derive(Clone)]
pub struct BroadcastDelegate {
    chain: Arc<dyn ChainReader>,
    blocks: Arc<BlockBroadcaster>,
    verified: Arc<VerifiedBlockBroadcaster>,
    txs: Arc<TxBroadcaster>,
}

impl BroadcastDelegate {
    /// A freshly mined block that still needs verification.
    pub fn broadcast_mined_block(&self, block: &Block) {
        self.blocks.broadcast_block(block);
    }

    pub fn broadcast_tx(&self, txs: &[Transaction]) {
        self.txs.broadcast_tx(txs);
    }

    /// A committed block. Its seen commits are read from the chain.
    pub fn broadcast_verified_block(&self, block: &Block) {
        let Some(seen_commits) = self.chain.get_seen_commits(block.number()) else {
            warn!(
                height = block.number(),
                hash = %to_hex(&block.hash()),
                "no seen commits for verified block, not broadcasting"
            );
            return;
        };
        self.verified
            .broadcast_verified(&CatchupBundle::new(block.clone(), seen_commits));
    }
}

/// Build the cs protocol manager with all of its services registered.
///
/// Nothing is started; call [`CsProtocolManager::start`] once the p2p
/// server is ready to hand over connections.
pub fn make_cs_protocol_manager(
    config: Arc<ChainCommConfig>,
    deps: ChainCommDeps,
) -> anyhow::Result<(Arc<CsProtocolManager>, BroadcastDelegate, FetcherHandle)> {
    let role = config.self_role().context("resolving local role")?;
    let self_node = config.self_node().context("parsing local node url")?;
    let verifier_boots = config
        .verifier_boot_urls()
        .context("parsing verifier boot nodes")?;
    if role != SelfRole::Base && deps.signer.is_none() {
        anyhow::bail!("{} node needs a signer", role.as_str());
    }
    let self_address = deps
        .signer
        .as_ref()
        .map_or(ZERO_ADDRESS, |signer| signer.address());

    let core = Arc::new(CsPeerManager::new(
        config.clone(),
        role,
        self_node,
        self_address,
        verifier_boots,
        deps.chain.clone(),
        deps.verifiers.clone(),
        deps.consensus.clone(),
    ));
    let pm: Arc<dyn PeerManager> = core.clone();
    let manager = Arc::new(CsProtocolManager::new(
        core.clone(),
        deps.p2p.clone(),
        deps.signer.clone(),
    ));

    let txs = TxBroadcaster::new(config.node.node_type, pm.clone(), deps.tx_pool.clone());
    manager.register_communication_service(txs.clone(), Some(txs.clone()))?;
    manager.register_peer_observer(txs.clone());

    let blocks = Arc::new(BlockBroadcaster::new(pm.clone(), deps.consensus.clone()));
    manager.register_communication_service(blocks.clone(), Some(blocks.clone()))?;

    let fetcher = Arc::new(BlockFetcher::new(config.fetcher.clone(), deps.chain.clone()));
    let fetcher_handle = fetcher.handle();
    let verified = Arc::new(VerifiedBlockBroadcaster::new(
        deps.chain.clone(),
        pm.clone(),
        fetcher_handle.clone(),
    ));
    fetcher.set_import_observer(verified.clone());
    manager.register_communication_service(verified.clone(), Some(verified.clone()))?;
    manager.register_executable(fetcher);

    let downloader = Downloader::new(
        config.clone(),
        deps.chain.clone(),
        pm.clone(),
        fetcher_handle.clone(),
    );
    manager.register_communication_service(downloader.clone(), Some(downloader))?;

    match role {
        SelfRole::Verifier => {
            let finder = Arc::new(VerifierFinder::new(
                deps.chain.clone(),
                core.clone(),
                deps.p2p.clone(),
                config.sync.verifier_finder_timeout(),
            ));
            manager.register_communication_service(finder.clone(), Some(finder.clone()))?;
            manager.set_verifier_finder(finder);
        }
        SelfRole::Boot => {
            let boot = Arc::new(VerifierBootService::new(deps.chain.clone(), core.clone()));
            manager.register_communication_service(boot, None)?;
        }
        SelfRole::Base => {}
    }

    info!(
        role = role.as_str(),
        node_type = ?config.node.node_type,
        protocol = %config.cs_protocol_name(),
        "cs protocol manager built"
    );

    let delegate = BroadcastDelegate {
        chain: deps.chain,
        blocks,
        verified,
        txs,
    };
    Ok((manager, delegate, fetcher_handle))
}
