//! # Verified-Block Broadcaster
//!
//! Disseminates committed blocks together with their seen commits.
//!
//! Verifiers and a √N sample of the other peers receive the full
//! `VerifyBlockResultMsg`; the remaining peers only get the hash
//! announcement and pull the bundle through the block fetcher when they
//! need it:
//!
//! ```text
//! VerifyBlockHashResultMsg ──► fetcher.notify ──(arrive timeout)──► GetVerifyResultMsg
//!                                                                         │
//!            fetcher.do_task ◄── VerifyBlockResultMsg ◄── on_get_verified_result
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{to_hex, CatchupBundle, Hash};
use tracing::{debug, info, warn};

use super::{fan_out, Outbound, TransportRegistry, MAX_KNOWN_BLOCKS, MAX_QUEUED_BLOCKS};
use crate::domain::{
    BlockHashMsg, CommError, Msg, Peer, GET_VERIFY_RESULT_MSG, VERIFY_BLOCK_HASH_RESULT_MSG,
    VERIFY_BLOCK_RESULT_MSG,
};
use crate::fetcher::FetcherHandle;
use crate::ports::{
    BlockImportObserver, ChainReader, CommunicationExecutable, CommunicationService, FetchRequest,
    PeerManager,
};

pub struct VerifiedBlockBroadcaster {
    chain: Arc<dyn ChainReader>,
    fetcher: FetcherHandle,
    transports: TransportRegistry,
}

impl VerifiedBlockBroadcaster {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        pm: Arc<dyn PeerManager>,
        fetcher: FetcherHandle,
    ) -> Self {
        Self {
            chain,
            fetcher,
            transports: TransportRegistry::new(
                "verified",
                MAX_KNOWN_BLOCKS,
                MAX_QUEUED_BLOCKS,
                pm,
            ),
        }
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Push `bundle` to the peers that do not know it yet.
    pub fn broadcast_verified(&self, bundle: &CatchupBundle) {
        let hash = bundle.hash();
        let peers: Vec<Arc<Peer>> = self
            .transports
            .pm()
            .get_peers()
            .into_values()
            .filter(|p| !self.transports.peer_knows(p.id(), &hash))
            .collect();
        let total = peers.len();

        let (verifiers, others) = fan_out(peers.clone());
        let full: Vec<Arc<Peer>> = verifiers.into_iter().chain(others).collect();

        let result = Msg::encode(VERIFY_BLOCK_RESULT_MSG, bundle);
        for peer in &full {
            self.transports
                .get_or_spawn(peer)
                .try_enqueue(Outbound::new(result.clone(), vec![hash]));
        }

        let announce = Msg::encode(
            VERIFY_BLOCK_HASH_RESULT_MSG,
            &BlockHashMsg {
                block_hash: hash,
                block_number: bundle.number(),
            },
        );
        let mut announced = 0;
        for peer in peers
            .iter()
            .filter(|p| !full.iter().any(|f| f.id() == p.id()))
        {
            self.transports
                .get_or_spawn(peer)
                .try_enqueue(Outbound::new(announce.clone(), vec![hash]));
            announced += 1;
        }

        info!(
            height = bundle.number(),
            peers = total,
            full = full.len(),
            announced,
            "broadcasting verified block"
        );
    }

    async fn on_verified_result_block_hash(
        &self,
        msg: Msg,
        peer: Arc<Peer>,
    ) -> Result<(), CommError> {
        let data: BlockHashMsg = msg.decode()?;
        let local = self.chain.current_block().number();
        if data.block_number <= local {
            debug!(
                from = %peer.node_name(),
                height = data.block_number,
                local,
                "verified block hash not above local head"
            );
            return Ok(());
        }

        peer.set_head(data.block_hash, data.block_number);
        self.transports.get_or_spawn(&peer).mark(data.block_hash);

        if self.chain.get_block_by_hash(&data.block_hash).is_some() {
            return Ok(());
        }

        let request = Arc::new(GetVerifyResultRequest {
            peer: peer.clone(),
            height: data.block_number,
        });
        self.fetcher
            .notify(peer.id(), data.block_hash, data.block_number, request)
            .await;
        Ok(())
    }

    async fn on_get_verified_result(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let height: u64 = msg.decode()?;
        let Some(block) = self.chain.get_block_by_number(height) else {
            warn!(from = %peer.node_name(), height, "requested verified block not found");
            return Ok(());
        };
        let Some(seen_commits) = self.chain.get_seen_commits(height) else {
            warn!(from = %peer.node_name(), height, "requested seen commits not found");
            return Ok(());
        };

        let bundle = CatchupBundle::new(block, seen_commits);
        if let Err(e) = peer.send(VERIFY_BLOCK_RESULT_MSG, &bundle).await {
            warn!(peer = %peer.node_name(), height, error = %e, "send verified result failed");
        }
        Ok(())
    }

    async fn on_verified_result_block(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let bundle: CatchupBundle = msg.decode()?;
        let hash: Hash = bundle.hash();
        self.transports.get_or_spawn(&peer).mark(hash);
        debug!(
            from = %peer.node_name(),
            height = bundle.number(),
            hash = %to_hex(&hash),
            "received verified block"
        );
        self.fetcher.do_task(peer.id(), bundle).await;
        Ok(())
    }
}

#[async_trait]
impl CommunicationService for VerifiedBlockBroadcaster {
    fn msg_codes(&self) -> Vec<u64> {
        vec![
            VERIFY_BLOCK_RESULT_MSG,
            VERIFY_BLOCK_HASH_RESULT_MSG,
            GET_VERIFY_RESULT_MSG,
        ]
    }

    async fn handle_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        match msg.code {
            VERIFY_BLOCK_RESULT_MSG => self.on_verified_result_block(msg, peer).await,
            VERIFY_BLOCK_HASH_RESULT_MSG => self.on_verified_result_block_hash(msg, peer).await,
            GET_VERIFY_RESULT_MSG => self.on_get_verified_result(msg, peer).await,
            code => Err(CommError::HandlerNotFound(code)),
        }
    }
}

impl CommunicationExecutable for VerifiedBlockBroadcaster {
    fn start(&self) -> Result<(), CommError> {
        Ok(())
    }

    fn stop(&self) {
        self.transports.close();
    }
}

impl BlockImportObserver for VerifiedBlockBroadcaster {
    fn on_block_imported(&self, bundle: CatchupBundle) {
        self.broadcast_verified(&bundle);
    }
}

/// Asks the announcing peer for the bundle at `height`.
struct GetVerifyResultRequest {
    peer: Arc<Peer>,
    height: u64,
}

#[async_trait]
impl FetchRequest for GetVerifyResultRequest {
    async fn request(&self) -> Result<(), CommError> {
        self.peer.send(GET_VERIFY_RESULT_MSG, &self.height).await?;
        Ok(())
    }
}
