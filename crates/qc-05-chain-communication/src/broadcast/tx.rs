//! # Transaction Broadcaster
//!
//! Relays transactions between peers and seeds newly connected peers with
//! the local pool.
//!
//! ## Pool Sync
//!
//! A new peer gets every pending transaction once. A single sync loop paces
//! this: it sends at most [`TX_SYNC_PACK_SIZE`] bytes per pack, waits for the
//! pack to be written, then picks the next pending peer at random.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::IteratorRandom;
use shared_types::{NodeType, Transaction};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{transfer_len, Outbound, TransportRegistry};
use crate::domain::{CommError, Msg, Peer, TransportError, TX_V1_MSG};
use crate::ports::{
    CommunicationExecutable, CommunicationService, PeerManager, PeerObserver, TxPool,
};

/// Per-peer known-transaction cache size.
pub const MAX_KNOWN_TXS: usize = 32768;

/// Per-peer transaction queue depth.
pub const MAX_QUEUED_TXS: usize = 128;

/// Upper bound on the encoded size of one pool-sync pack (500 KiB).
pub const TX_SYNC_PACK_SIZE: usize = 500 * 1024;

const NEW_PEER_BUFFER: usize = 64;

pub struct TxBroadcaster {
    me: Weak<TxBroadcaster>,
    self_type: NodeType,
    pool: Arc<dyn TxPool>,
    transports: TransportRegistry,
    new_peers_tx: mpsc::Sender<Arc<Peer>>,
    new_peers_rx: Mutex<Option<mpsc::Receiver<Arc<Peer>>>>,
    started: AtomicBool,
    stop_tx: watch::Sender<bool>,
}

impl TxBroadcaster {
    pub fn new(self_type: NodeType, pm: Arc<dyn PeerManager>, pool: Arc<dyn TxPool>) -> Arc<Self> {
        let (new_peers_tx, new_peers_rx) = mpsc::channel(NEW_PEER_BUFFER);
        let (stop_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            self_type,
            pool,
            transports: TransportRegistry::new("tx", MAX_KNOWN_TXS, MAX_QUEUED_TXS, pm),
            new_peers_tx,
            new_peers_rx: Mutex::new(Some(new_peers_rx)),
            started: AtomicBool::new(false),
            stop_tx,
        })
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Queue `txs` for every peer, minus what each peer already knows.
    pub fn broadcast_tx(&self, txs: &[Transaction]) {
        let peers: Vec<Arc<Peer>> = self.transports.pm().get_peers().into_values().collect();
        self.send_unknown(&peers, txs);
    }

    fn send_unknown(&self, peers: &[Arc<Peer>], txs: &[Transaction]) {
        let hashed: Vec<_> = txs.iter().map(|tx| (tx.hash(), tx)).collect();
        for peer in peers {
            let transport = self.transports.get_or_spawn(peer);
            let (hashes, unknown): (Vec<_>, Vec<Transaction>) = hashed
                .iter()
                .filter(|(hash, _)| !transport.knows(hash))
                .map(|(hash, tx)| (*hash, (*tx).clone()))
                .unzip();
            if unknown.is_empty() {
                continue;
            }
            debug!(to = %peer.node_name(), txs = unknown.len(), "queueing transactions");
            transport.try_enqueue(Outbound::new(Msg::encode_list(TX_V1_MSG, &unknown), hashes));
        }
    }

    async fn on_txs(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let txs: Vec<Transaction> = msg.decode_list()?;
        if txs.is_empty() {
            return Ok(());
        }
        let transport = self.transports.get_or_spawn(&peer);
        for tx in &txs {
            transport.mark(tx.hash());
        }

        let results = self.pool.add_remotes(txs.clone());
        let accepted: Vec<Transaction> = txs
            .into_iter()
            .zip(results)
            .filter_map(|(tx, result)| match result {
                Ok(()) => Some(tx),
                Err(e) => {
                    debug!(from = %peer.node_name(), reason = %e.0, "remote transaction rejected");
                    None
                }
            })
            .collect();

        if accepted.is_empty() || self.self_type == NodeType::MineMaster {
            return Ok(());
        }
        self.relay(&accepted, peer.id());
        Ok(())
    }

    /// Forward accepted transactions to every mine master and a √N sample of
    /// the other peers.
    fn relay(&self, txs: &[Transaction], from: &str) {
        let (masters, others): (Vec<_>, Vec<_>) = self
            .transports
            .pm()
            .get_peers()
            .into_values()
            .filter(|p| p.id() != from)
            .partition(|p| p.node_type() == NodeType::MineMaster);
        let sample_len = transfer_len(others.len());
        let sample = others
            .into_iter()
            .choose_multiple(&mut rand::thread_rng(), sample_len);

        let targets: Vec<Arc<Peer>> = masters.into_iter().chain(sample).collect();
        debug!(txs = txs.len(), peers = targets.len(), "relaying transactions");
        self.send_unknown(&targets, txs);
    }

    // =========================================================================
    // POOL SYNC
    // =========================================================================

    async fn run_sync(
        self: Arc<Self>,
        mut new_peers: mpsc::Receiver<Arc<Peer>>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut pending: HashMap<String, PendingSync> = HashMap::new();
        let (done_tx, mut done_rx) = mpsc::channel::<Result<(), TransportError>>(1);
        let mut sending = false;

        loop {
            if !sending {
                if let Some(pack) = pick_pack(&mut pending) {
                    sending = true;
                    let done = done_tx.clone();
                    let transport = self.transports.get_or_spawn(&pack.peer);
                    tokio::spawn(async move {
                        for tx in &pack.txs {
                            transport.mark(tx.hash());
                        }
                        let result = pack
                            .peer
                            .send_msg(Msg::encode_list(TX_V1_MSG, &pack.txs))
                            .await;
                        debug!(to = %pack.peer.node_name(), txs = pack.txs.len(), "sent pool sync pack");
                        let _ = done.send(result).await;
                    });
                }
            }

            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return,
                peer = new_peers.recv() => match peer {
                    Some(peer) => {
                        let txs: Vec<Transaction> = self.pool.pending().into_values().flatten().collect();
                        if !txs.is_empty() {
                            pending.insert(peer.id().to_string(), PendingSync { peer, txs });
                        }
                    }
                    None => return,
                },
                Some(result) = done_rx.recv() => {
                    sending = false;
                    if let Err(e) = result {
                        warn!(error = %e, "pool sync send failed");
                    }
                }
            }
        }
    }
}

struct PendingSync {
    peer: Arc<Peer>,
    txs: Vec<Transaction>,
}

/// Take up to [`TX_SYNC_PACK_SIZE`] bytes of transactions for a random
/// pending peer. A pack always holds at least one transaction.
fn pick_pack(pending: &mut HashMap<String, PendingSync>) -> Option<PendingSync> {
    let id = pending.keys().choose(&mut rand::thread_rng())?.clone();
    let entry = pending.get_mut(&id)?;

    let mut size = 0;
    let mut count = 0;
    for tx in &entry.txs {
        if count > 0 && size + tx.size() > TX_SYNC_PACK_SIZE {
            break;
        }
        size += tx.size();
        count += 1;
    }
    let txs: Vec<Transaction> = entry.txs.drain(..count).collect();
    let peer = entry.peer.clone();
    if entry.txs.is_empty() {
        pending.remove(&id);
    }
    Some(PendingSync { peer, txs })
}

impl PeerObserver for TxBroadcaster {
    fn on_new_peer(&self, peer: Arc<Peer>) {
        if let Err(e) = self.new_peers_tx.try_send(peer) {
            warn!(error = %e, "pool sync queue full, new peer skipped");
        }
    }
}

#[async_trait]
impl CommunicationService for TxBroadcaster {
    fn msg_codes(&self) -> Vec<u64> {
        vec![TX_V1_MSG]
    }

    async fn handle_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        self.on_txs(msg, peer).await
    }
}

impl CommunicationExecutable for TxBroadcaster {
    fn start(&self) -> Result<(), CommError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CommError::AlreadyStarted);
        }
        let new_peers = self
            .new_peers_rx
            .lock()
            .take()
            .ok_or(CommError::AlreadyStarted)?;
        let this = self.me.upgrade().ok_or(CommError::Stopped)?;
        tokio::spawn(this.run_sync(new_peers, self.stop_tx.subscribe()));
        info!("tx broadcaster started");
        Ok(())
    }

    fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.transports.close();
    }
}
