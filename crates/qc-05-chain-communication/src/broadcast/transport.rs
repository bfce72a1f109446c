//! # Per-Peer Transport
//!
//! One task per (broadcaster, peer) pair drains a bounded queue and writes
//! one message at a time. A full queue drops the new message. The task ends
//! when the peer is gone, a send fails, nothing was queued for five
//! minutes, or the registry is closed; the registry entry is removed with it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use shared_types::Hash;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::domain::{code_name, Msg, Peer, TransportError};
use crate::ports::PeerManager;

/// Transports with nothing to send for this long are discarded.
pub const TRANSPORT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A queued message and the hashes it makes the peer aware of.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub msg: Msg,
    pub hashes: Vec<Hash>,
}

impl Outbound {
    pub fn new(msg: Msg, hashes: Vec<Hash>) -> Self {
        Self { msg, hashes }
    }
}

pub struct PeerTransport {
    peer_id: String,
    peer_name: String,
    known: Mutex<LruCache<Hash, ()>>,
    queue: mpsc::Sender<Outbound>,
}

impl PeerTransport {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Whether the task draining this transport has exited.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn knows(&self, hash: &Hash) -> bool {
        self.known.lock().contains(hash)
    }

    pub fn mark(&self, hash: Hash) {
        self.known.lock().put(hash, ());
    }

    /// Queue without waiting. Returns false when the message was dropped.
    pub fn try_enqueue(&self, outbound: Outbound) -> bool {
        let code = outbound.msg.code;
        match self.queue.try_send(outbound) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                info!(peer = %self.peer_name, msg = code_name(code), "outbound queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer = %self.peer_name, "transport already closed");
                false
            }
        }
    }
}

/// Transports of one broadcaster, keyed by peer id.
pub struct TransportRegistry {
    name: &'static str,
    known_capacity: NonZeroUsize,
    queue_depth: usize,
    pm: Arc<dyn PeerManager>,
    transports: Arc<Mutex<HashMap<String, Arc<PeerTransport>>>>,
    stop_tx: watch::Sender<bool>,
}

impl TransportRegistry {
    pub fn new(
        name: &'static str,
        known_capacity: usize,
        queue_depth: usize,
        pm: Arc<dyn PeerManager>,
    ) -> Self {
        Self {
            name,
            known_capacity: NonZeroUsize::new(known_capacity).unwrap_or(NonZeroUsize::MIN),
            queue_depth: queue_depth.max(1),
            pm,
            transports: Arc::new(Mutex::new(HashMap::new())),
            stop_tx: watch::channel(false).0,
        }
    }

    pub fn pm(&self) -> &Arc<dyn PeerManager> {
        &self.pm
    }

    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, peer_id: &str) -> Option<Arc<PeerTransport>> {
        self.transports.lock().get(peer_id).cloned()
    }

    /// Stop every transport task and forget all peers. Transports spawned
    /// afterwards exit on their first poll.
    pub fn close(&self) {
        self.stop_tx.send_replace(true);
        let closed = std::mem::take(&mut *self.transports.lock());
        debug!(broadcaster = self.name, transports = closed.len(), "peer transports closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Transport for `peer`, spawning its task on first use.
    pub fn get_or_spawn(&self, peer: &Peer) -> Arc<PeerTransport> {
        let mut transports = self.transports.lock();
        if let Some(existing) = transports.get(peer.id()) {
            return existing.clone();
        }

        let (tx, rx) = mpsc::channel(self.queue_depth);
        let transport = Arc::new(PeerTransport {
            peer_id: peer.id().to_string(),
            peer_name: peer.node_name(),
            known: Mutex::new(LruCache::new(self.known_capacity)),
            queue: tx,
        });
        transports.insert(peer.id().to_string(), transport.clone());
        debug!(broadcaster = self.name, peer = %peer.node_name(), "new peer transport");

        tokio::spawn(run_transport(
            self.name,
            transport.clone(),
            rx,
            self.pm.clone(),
            self.transports.clone(),
            self.stop_tx.subscribe(),
        ));
        transport
    }

    /// Whether `peer` is already known to have `hash`.
    pub fn peer_knows(&self, peer_id: &str, hash: &Hash) -> bool {
        self.get(peer_id).is_some_and(|t| t.knows(hash))
    }
}

async fn run_transport(
    name: &'static str,
    transport: Arc<PeerTransport>,
    mut rx: mpsc::Receiver<Outbound>,
    pm: Arc<dyn PeerManager>,
    registry: Arc<Mutex<HashMap<String, Arc<PeerTransport>>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => {
                debug!(broadcaster = name, peer = %transport.peer_name, "transport stopped");
                break;
            }
            next = tokio::time::timeout(TRANSPORT_IDLE_TIMEOUT, rx.recv()) => next,
        };
        let outbound = match next {
            Ok(Some(outbound)) => outbound,
            Ok(None) => break,
            Err(_) => {
                debug!(broadcaster = name, peer = %transport.peer_name, "idle transport discarded");
                break;
            }
        };

        for hash in &outbound.hashes {
            transport.mark(*hash);
        }

        let Some(peer) = pm.get_peer(&transport.peer_id) else {
            debug!(broadcaster = name, peer = %transport.peer_name, "peer gone, transport closed");
            break;
        };

        let code = outbound.msg.code;
        match peer.send_msg(outbound.msg).await {
            Ok(()) => {}
            Err(TransportError::ShuttingDown) => {
                warn!(broadcaster = name, peer = %transport.peer_name, "peer shutting down, removing");
                pm.remove_peer(&transport.peer_id);
                break;
            }
            Err(e) => {
                warn!(
                    broadcaster = name,
                    peer = %transport.peer_name,
                    msg = code_name(code),
                    error = %e,
                    "broadcast send failed"
                );
                break;
            }
        }
    }

    let mut transports = registry.lock();
    if transports
        .get(&transport.peer_id)
        .is_some_and(|t| Arc::ptr_eq(t, &transport))
    {
        transports.remove(&transport.peer_id);
    }
}
