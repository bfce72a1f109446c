//! Mined-block broadcaster: pushes blocks awaiting verification and hands
//! received ones to the consensus engine.

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{to_hex, Block};
use tracing::{debug, info};

use super::{fan_out, Outbound, TransportRegistry, MAX_KNOWN_BLOCKS, MAX_QUEUED_BLOCKS};
use crate::domain::{CommError, Msg, Peer, NEW_BLOCK_V1_MSG};
use crate::ports::{CommunicationExecutable, CommunicationService, ConsensusEngine, PeerManager};

pub struct BlockBroadcaster {
    transports: TransportRegistry,
    consensus: Arc<dyn ConsensusEngine>,
}

impl BlockBroadcaster {
    pub fn new(pm: Arc<dyn PeerManager>, consensus: Arc<dyn ConsensusEngine>) -> Self {
        Self {
            transports: TransportRegistry::new("block", MAX_KNOWN_BLOCKS, MAX_QUEUED_BLOCKS, pm),
            consensus,
        }
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Push `block` to every verifier and to a sample of the other peers
    /// that do not know it yet.
    pub fn broadcast_block(&self, block: &Block) {
        let hash = block.hash();
        let peers: Vec<Arc<Peer>> = self
            .transports
            .pm()
            .get_peers()
            .into_values()
            .filter(|p| !self.transports.peer_knows(p.id(), &hash))
            .collect();

        let (verifiers, others) = fan_out(peers);
        info!(
            height = block.number(),
            verifiers = verifiers.len(),
            others = others.len(),
            "broadcasting block"
        );

        let msg = Msg::encode(NEW_BLOCK_V1_MSG, block);
        for peer in verifiers.iter().chain(others.iter()) {
            let transport = self.transports.get_or_spawn(peer);
            transport.try_enqueue(Outbound::new(msg.clone(), vec![hash]));
            debug!(to = %peer.node_name(), height = block.number(), txs = block.tx_count(), "block queued");
        }
    }

    fn on_new_block(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let block: Block = msg.decode()?;
        let hash = block.hash();
        self.transports.get_or_spawn(&peer).mark(hash);
        debug!(from = %peer.node_name(), height = block.number(), hash = %to_hex(&hash), "received new block");
        self.consensus.on_new_wait_verify_block(block, peer.id());
        Ok(())
    }
}

#[async_trait]
impl CommunicationService for BlockBroadcaster {
    fn msg_codes(&self) -> Vec<u64> {
        vec![NEW_BLOCK_V1_MSG]
    }

    async fn handle_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        self.on_new_block(msg, peer)
    }
}

impl CommunicationExecutable for BlockBroadcaster {
    fn start(&self) -> Result<(), CommError> {
        Ok(())
    }

    fn stop(&self) {
        self.transports.close();
    }
}
