//! # Catch-up Downloader
//!
//! Pulls committed bundles from the best peer when the local head trails it.
//!
//! ## Session
//!
//! ```text
//! poll (10 s) → best peer above local head? → GetBlocks(origin = local height)
//!     → wait BlocksMsg (60 s per batch) → fetcher filter → save in order
//!     → next batch from last + 1, until local height reaches remote height
//! ```
//!
//! One session runs at a time. The block at the current height is requested
//! again because empty blocks may have replaced it.
//!
//! The same service answers `GetBlocksMsg` from remote peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::CatchupBundle;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::ChainCommConfig;
use crate::domain::{
    ChainError, CommError, GetBlocksReq, Msg, Peer, BLOCKS_MSG, GET_BLOCKS_MSG, MAX_BLOCK_FETCH,
};
use crate::fetcher::FetcherHandle;
use crate::ports::{ChainReader, CommunicationExecutable, CommunicationService, PeerManager};

/// Undelivered `BlocksMsg` packets kept for the running session.
const PACKET_BUFFER: usize = 8;

/// A `BlocksMsg` as received from one peer.
#[derive(Debug)]
struct BlocksPacket {
    peer_id: String,
    bundles: Vec<CatchupBundle>,
}

/// Why a sync session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another session was already running.
    Busy,
    /// No peer is ahead of the local head.
    UpToDate,
    /// The local head reached the remote height.
    Completed,
    /// The remote sent an empty batch.
    Exhausted,
    /// A batch did not arrive in time.
    TimedOut,
    /// A save failed or the peer went away.
    Aborted,
}

struct SyncingGuard<'a>(&'a AtomicBool);

impl Drop for SyncingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Downloader {
    me: Weak<Downloader>,
    config: Arc<ChainCommConfig>,
    chain: Arc<dyn ChainReader>,
    pm: Arc<dyn PeerManager>,
    fetcher: FetcherHandle,
    packets_tx: mpsc::Sender<BlocksPacket>,
    packets_rx: tokio::sync::Mutex<mpsc::Receiver<BlocksPacket>>,
    synchronising: AtomicBool,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
    last_outcome: Mutex<Option<SyncOutcome>>,
}

impl Downloader {
    pub fn new(
        config: Arc<ChainCommConfig>,
        chain: Arc<dyn ChainReader>,
        pm: Arc<dyn PeerManager>,
        fetcher: FetcherHandle,
    ) -> Arc<Self> {
        let (packets_tx, packets_rx) = mpsc::channel(PACKET_BUFFER);
        let (stop_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            chain,
            pm,
            fetcher,
            packets_tx,
            packets_rx: tokio::sync::Mutex::new(packets_rx),
            synchronising: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stop_tx,
            last_outcome: Mutex::new(None),
        })
    }

    pub fn is_synchronising(&self) -> bool {
        self.synchronising.load(Ordering::SeqCst)
    }

    pub fn last_outcome(&self) -> Option<SyncOutcome> {
        *self.last_outcome.lock()
    }

    // =========================================================================
    // SERVING
    // =========================================================================

    /// Bundles from `req.origin_height` upward, stopping at the first gap.
    pub fn collect_bundles(&self, req: &GetBlocksReq) -> Vec<CatchupBundle> {
        let limit = req.amount.min(MAX_BLOCK_FETCH);
        let mut bundles = Vec::new();
        let mut height = req.origin_height;
        while (bundles.len() as u64) < limit {
            let Some(block) = self.chain.get_block_by_number(height) else {
                debug!(height, "no block for downloader request");
                break;
            };
            let commits = self.chain.get_seen_commits(height).unwrap_or_default();
            bundles.push(CatchupBundle::new(block, commits));
            height += 1;
        }
        bundles
    }

    async fn on_get_blocks(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let req: GetBlocksReq = msg.decode()?;
        let bundles = self.collect_bundles(&req);
        info!(
            peer = %peer.node_name(),
            origin = req.origin_height,
            amount = req.amount,
            served = bundles.len(),
            "serving blocks to remote"
        );
        peer.send_msg(Msg::encode_list(BLOCKS_MSG, &bundles)).await?;
        Ok(())
    }

    fn on_blocks(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let bundles: Vec<CatchupBundle> = msg.decode_list()?;
        debug!(peer = %peer.node_name(), count = bundles.len(), "downloader received blocks");
        let packet = BlocksPacket {
            peer_id: peer.id().to_string(),
            bundles,
        };
        if self.packets_tx.try_send(packet).is_err() {
            warn!(peer = %peer.id(), "no sync session waiting, blocks dropped");
        }
        Ok(())
    }

    // =========================================================================
    // SYNC
    // =========================================================================

    fn sync_target(&self) -> Option<Arc<Peer>> {
        let best = self.pm.best_peer()?;
        let local = self.chain.current_block().number();
        let remote = best.head().height;
        if remote <= local {
            debug!(peer = %best.node_name(), remote, local, "local head not behind best peer");
            return None;
        }
        info!(peer = %best.node_name(), remote, local, "downloader picked best peer");
        Some(best)
    }

    /// Run one sync session against the best peer.
    pub async fn run_sync(&self) -> SyncOutcome {
        if self
            .synchronising
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("downloader is busy");
            return SyncOutcome::Busy;
        }
        let _guard = SyncingGuard(&self.synchronising);

        let outcome = match self.sync_target() {
            Some(peer) => self.fetch_blocks(peer).await,
            None => SyncOutcome::UpToDate,
        };

        *self.last_outcome.lock() = Some(outcome);
        outcome
    }

    async fn fetch_blocks(&self, peer: Arc<Peer>) -> SyncOutcome {
        let mut packets = self.packets_rx.lock().await;
        while packets.try_recv().is_ok() {}

        let remote_height = peer.head().height;
        let mut origin = self.chain.current_block().number();
        let batch_timeout = self.config.sync.fetch_block_timeout();
        let mut stop = self.stop_tx.subscribe();

        if let Err(e) = request_batch(&peer, origin).await {
            error!(peer = %peer.node_name(), error = %e, "first get blocks request failed");
            return SyncOutcome::Aborted;
        }
        let mut deadline = Instant::now() + batch_timeout;

        loop {
            let packet = tokio::select! {
                _ = stop.wait_for(|s| *s) => return SyncOutcome::Aborted,
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(peer = %peer.node_name(), origin, "waiting for blocks timed out");
                    return SyncOutcome::TimedOut;
                }
                packet = packets.recv() => match packet {
                    Some(packet) => packet,
                    None => return SyncOutcome::Aborted,
                },
            };

            if packet.peer_id != peer.id() {
                warn!(peer = %packet.peer_id, expected = %peer.id(), "blocks from unexpected peer ignored");
                continue;
            }
            let Some(last) = packet.bundles.last().map(CatchupBundle::number) else {
                info!(peer = %peer.node_name(), "remote has no more blocks");
                return SyncOutcome::Exhausted;
            };

            let remaining = self.fetcher.do_filter(peer.id(), packet.bundles).await;
            if let Err(e) = self.import_bundles(remaining) {
                error!(peer = %peer.node_name(), error = %e, "downloader save block failed");
                return SyncOutcome::Aborted;
            }

            if self.chain.current_block().number() >= remote_height {
                info!(height = remote_height, "downloader reached remote height");
                return SyncOutcome::Completed;
            }

            origin = last + 1;
            if !peer.is_running() {
                warn!(peer = %peer.node_name(), "sync peer disconnected");
                return SyncOutcome::Aborted;
            }
            if let Err(e) = request_batch(&peer, origin).await {
                warn!(peer = %peer.node_name(), error = %e, "get blocks request failed");
                if e.is_broken() {
                    return SyncOutcome::Aborted;
                }
            }
            deadline = Instant::now() + batch_timeout;
        }
    }

    /// Save in ascending order. Blocks already at the current height are skipped.
    fn import_bundles(&self, mut bundles: Vec<CatchupBundle>) -> Result<(), ChainError> {
        bundles.sort_by_key(CatchupBundle::number);
        for bundle in bundles {
            let number = bundle.number();
            if bundle.seen_commits.is_empty() {
                warn!(height = number, "downloaded block carries no commits");
            }
            match self.chain.save_block(&bundle.block, &bundle.seen_commits) {
                Ok(()) => debug!(height = number, "downloader saved block"),
                Err(ChainError::HeightIsCurrentAndNotSpecial { .. }) => {
                    debug!(height = number, "block height already current, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sync.downloader_poll());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
                _ = ticker.tick() => {
                    let outcome = self.run_sync().await;
                    debug!(?outcome, "downloader sync round finished");
                }
            }
        }
        debug!("downloader stopped");
    }
}

async fn request_batch(peer: &Peer, origin: u64) -> Result<(), CommError> {
    let req = GetBlocksReq {
        origin_height: origin,
        amount: MAX_BLOCK_FETCH,
    };
    debug!(peer = %peer.node_name(), origin, "requesting blocks");
    peer.send(GET_BLOCKS_MSG, &req).await?;
    Ok(())
}

#[async_trait]
impl CommunicationService for Downloader {
    fn msg_codes(&self) -> Vec<u64> {
        vec![GET_BLOCKS_MSG, BLOCKS_MSG]
    }

    async fn handle_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        match msg.code {
            GET_BLOCKS_MSG => self.on_get_blocks(msg, peer).await,
            BLOCKS_MSG => self.on_blocks(msg, peer),
            code => Err(CommError::HandlerNotFound(code)),
        }
    }
}

impl CommunicationExecutable for Downloader {
    fn start(&self) -> Result<(), CommError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CommError::AlreadyStarted);
        }
        let this = self.me.upgrade().ok_or(CommError::Stopped)?;
        tokio::spawn(this.run(self.stop_tx.subscribe()));
        info!("downloader started");
        Ok(())
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
