//! # Fetcher State
//!
//! Announcement bookkeeping of the block fetcher. Owned by a single task;
//! every method is synchronous and takes the time and chain view it needs
//! as arguments.
//!
//! ## Tables
//!
//! | Table | Holds |
//! |-------|-------|
//! | `notified` | announcements waiting for the fetch timer |
//! | `fetching` | the one announcement whose request was issued |
//! | `finished` | delivered announcements awaiting import |
//! | `queued` | bundles in the import queue |
//!
//! `notify_count[peer]` always equals the number of announcements by that
//! peer referenced from `notified`, `fetching` and `finished`. A peer with a
//! zero count has no entry.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use rand::Rng;
use shared_types::{to_hex, CatchupBundle, Hash};
use tokio::time::Instant;
use tracing::debug;

use crate::config::FetcherConfig;
use crate::ports::FetchRequest;

/// A peer's claim that it holds a block.
#[derive(Clone)]
pub struct Announce {
    pub hash: Hash,
    pub number: u64,
    pub peer_id: String,
    pub time: Instant,
    pub request: Arc<dyn FetchRequest>,
}

impl std::fmt::Debug for Announce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Announce")
            .field("hash", &to_hex(&self.hash))
            .field("number", &self.number)
            .field("peer_id", &self.peer_id)
            .finish()
    }
}

/// Why an announcement was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Accepted,
    HashLimit,
    TooFar,
    ZeroNumber,
    AlreadyFetching,
}

#[derive(Debug, Clone)]
struct Inject {
    peer_id: String,
    bundle: CatchupBundle,
}

pub struct FetcherState {
    config: FetcherConfig,
    notify_count: HashMap<String, usize>,
    notified: HashMap<Hash, Vec<Announce>>,
    fetching: HashMap<Hash, Announce>,
    finished: HashMap<Hash, Announce>,
    queue: BinaryHeap<Reverse<(u64, Hash)>>,
    queues: HashMap<String, usize>,
    queued: HashMap<Hash, Inject>,
}

impl FetcherState {
    pub fn new(config: FetcherConfig) -> Self {
        Self {
            config,
            notify_count: HashMap::new(),
            notified: HashMap::new(),
            fetching: HashMap::new(),
            finished: HashMap::new(),
            queue: BinaryHeap::new(),
            queues: HashMap::new(),
            queued: HashMap::new(),
        }
    }

    // =========================================================================
    // ANNOUNCEMENTS
    // =========================================================================

    pub fn notify(&mut self, announce: Announce, chain_height: u64) -> NotifyOutcome {
        let count = self.notify_count(&announce.peer_id) + 1;
        if count > self.config.hash_limit {
            debug!(peer = %announce.peer_id, limit = self.config.hash_limit, "peer exceeded outstanding announces");
            return NotifyOutcome::HashLimit;
        }
        if announce.number == 0 {
            return NotifyOutcome::ZeroNumber;
        }
        if announce.number.saturating_sub(chain_height) > self.config.max_queue_dist {
            debug!(
                peer = %announce.peer_id,
                number = announce.number,
                chain_height,
                "announcement too far ahead, discarded"
            );
            return NotifyOutcome::TooFar;
        }
        if self.fetching.contains_key(&announce.hash) || self.finished.contains_key(&announce.hash)
        {
            return NotifyOutcome::AlreadyFetching;
        }

        self.notify_count.insert(announce.peer_id.clone(), count);
        self.notified
            .entry(announce.hash)
            .or_default()
            .push(announce);
        NotifyOutcome::Accepted
    }

    /// When the fetch timer should next fire.
    pub fn next_fetch_deadline(&self) -> Option<Instant> {
        self.notified
            .values()
            .filter_map(|list| list.first())
            .map(|a| a.time)
            .min()
            .map(|earliest| earliest + self.config.arrive_timeout())
    }

    /// Move every announcement that waited long enough into `fetching`,
    /// choosing one notifier at random. Returns the requests to issue.
    pub fn schedule_fetches(
        &mut self,
        now: Instant,
        has_block: impl Fn(&Hash) -> bool,
    ) -> Vec<(Hash, Arc<dyn FetchRequest>)> {
        let threshold = self
            .config
            .arrive_timeout()
            .saturating_sub(self.config.gather_slack());
        let due: Vec<Hash> = self
            .notified
            .iter()
            .filter(|(_, list)| {
                list.first()
                    .is_some_and(|a| now.saturating_duration_since(a.time) > threshold)
            })
            .map(|(hash, _)| *hash)
            .collect();

        let mut rng = rand::thread_rng();
        let mut requests = Vec::with_capacity(due.len());
        for hash in due {
            let Some(list) = self.notified.get(&hash) else {
                continue;
            };
            let chosen = list[rng.gen_range(0..list.len())].clone();
            self.forget_hash(&hash);
            if has_block(&hash) {
                continue;
            }
            *self.notify_count.entry(chosen.peer_id.clone()).or_insert(0) += 1;
            requests.push((hash, chosen.request.clone()));
            self.fetching.insert(hash, chosen);
        }
        requests
    }

    /// Drop requests that were not answered in time.
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.config.fetch_timeout();
        let stale: Vec<Hash> = self
            .fetching
            .iter()
            .filter(|(_, a)| now.saturating_duration_since(a.time) > timeout)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in stale {
            debug!(hash = %to_hex(&hash), "fetch timed out");
            self.forget_hash(&hash);
        }
    }

    // =========================================================================
    // DELIVERY
    // =========================================================================

    /// A bundle delivered in reply to a fetch request. Returns whether it was
    /// queued for import.
    pub fn deliver(
        &mut self,
        peer_id: &str,
        bundle: CatchupBundle,
        now: Instant,
        chain_height: u64,
        has_block: impl Fn(&Hash) -> bool,
    ) -> bool {
        let hash = bundle.hash();
        let Some(announce) = self.fetching.get(&hash) else {
            return false;
        };
        if announce.peer_id != peer_id || self.finished.contains_key(&hash) {
            return false;
        }
        if announce.number != bundle.number() {
            debug!(peer = %peer_id, announced = announce.number, delivered = bundle.number(), "delivered height mismatch");
            self.forget_hash(&hash);
            return false;
        }
        if has_block(&hash) {
            self.forget_hash(&hash);
            return false;
        }

        if let Some(mut announce) = self.fetching.remove(&hash) {
            announce.time = now;
            self.finished.insert(hash, announce);
        }
        self.enqueue(peer_id, bundle, chain_height)
    }

    /// Take the downloader's bundles that satisfy pending announcements.
    /// Returns the bundles left for the downloader.
    pub fn filter(
        &mut self,
        peer_id: &str,
        bundles: Vec<CatchupBundle>,
        chain_height: u64,
        has_block: impl Fn(&Hash) -> bool,
    ) -> Vec<CatchupBundle> {
        let mut remaining = Vec::with_capacity(bundles.len());
        let mut pending = Vec::new();
        for bundle in bundles {
            let hash = bundle.hash();
            if !self.notified.contains_key(&hash) || self.queued.contains_key(&hash) {
                remaining.push(bundle);
                continue;
            }
            if has_block(&hash) {
                self.forget_hash(&hash);
                continue;
            }
            if let Some(mut list) = self.notified.remove(&hash) {
                let kept = list.remove(0);
                for announce in list {
                    decrement(&mut self.notify_count, &announce.peer_id);
                }
                self.finished.insert(hash, kept);
            }
            pending.push(bundle);
        }
        for bundle in pending {
            self.enqueue(peer_id, bundle, chain_height);
        }
        remaining
    }

    fn enqueue(&mut self, peer_id: &str, bundle: CatchupBundle, chain_height: u64) -> bool {
        let hash = bundle.hash();
        let number = bundle.number();
        let count = self.queues.get(peer_id).copied().unwrap_or(0) + 1;
        if count > self.config.block_limit {
            debug!(peer = %peer_id, number, limit = self.config.block_limit, "queued block allowance exceeded");
            self.forget_hash(&hash);
            return false;
        }
        if number.saturating_sub(chain_height) > self.config.max_queue_dist {
            debug!(peer = %peer_id, number, chain_height, "queued block too far ahead");
            self.forget_hash(&hash);
            return false;
        }
        if self.queued.contains_key(&hash) {
            return false;
        }

        self.queues.insert(peer_id.to_string(), count);
        self.queued.insert(
            hash,
            Inject {
                peer_id: peer_id.to_string(),
                bundle,
            },
        );
        self.queue.push(Reverse((number, hash)));
        debug!(peer = %peer_id, number, queued = self.queue.len(), "block queued for import");
        true
    }

    // =========================================================================
    // IMPORT
    // =========================================================================

    /// Pop bundles that can be imported on top of `chain_height`, in
    /// ascending height. Bundles already in the chain are forgotten.
    pub fn pop_importable(
        &mut self,
        chain_height: u64,
        has_block: impl Fn(&Hash) -> bool,
    ) -> Vec<(String, CatchupBundle)> {
        let mut ready = Vec::new();
        while let Some(Reverse((number, hash))) = self.queue.peek().copied() {
            if number > chain_height + 1 {
                break;
            }
            self.queue.pop();
            if has_block(&hash) {
                self.done(&hash);
                continue;
            }
            if let Some(inject) = self.queued.get(&hash) {
                ready.push((inject.peer_id.clone(), inject.bundle.clone()));
            }
        }
        ready
    }

    /// An import attempt for `hash` finished, successfully or not.
    pub fn done(&mut self, hash: &Hash) {
        self.forget_hash(hash);
        self.forget_block(hash);
    }

    // =========================================================================
    // FORGETTING
    // =========================================================================

    pub fn forget_hash(&mut self, hash: &Hash) {
        let mut released = Vec::new();
        if let Some(list) = self.notified.remove(hash) {
            released.extend(list.into_iter().map(|a| a.peer_id));
        }
        if let Some(announce) = self.fetching.remove(hash) {
            released.push(announce.peer_id);
        }
        if let Some(announce) = self.finished.remove(hash) {
            released.push(announce.peer_id);
        }
        for peer in released {
            decrement(&mut self.notify_count, &peer);
        }
    }

    pub fn forget_block(&mut self, hash: &Hash) {
        if let Some(inject) = self.queued.remove(hash) {
            decrement(&mut self.queues, &inject.peer_id);
        }
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    pub fn notify_count(&self, peer_id: &str) -> usize {
        self.notify_count.get(peer_id).copied().unwrap_or(0)
    }

    pub fn notified_len(&self) -> usize {
        self.notified.len()
    }

    pub fn is_fetching(&self, hash: &Hash) -> bool {
        self.fetching.contains_key(hash)
    }

    pub fn is_finished(&self, hash: &Hash) -> bool {
        self.finished.contains_key(hash)
    }

    pub fn is_queued(&self, hash: &Hash) -> bool {
        self.queued.contains_key(hash)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Counters match table references, no hash is both fetching and
    /// finished, and every queued hash is finished.
    pub fn is_consistent(&self) -> bool {
        let mut refs: HashMap<&str, usize> = HashMap::new();
        for list in self.notified.values() {
            for a in list {
                *refs.entry(a.peer_id.as_str()).or_insert(0) += 1;
            }
        }
        for a in self.fetching.values().chain(self.finished.values()) {
            *refs.entry(a.peer_id.as_str()).or_insert(0) += 1;
        }
        let counts_match = refs.len() == self.notify_count.len()
            && refs
                .iter()
                .all(|(peer, n)| self.notify_count.get(*peer) == Some(n));
        let disjoint = self.fetching.keys().all(|h| !self.finished.contains_key(h))
            && self.queued.keys().all(|h| self.finished.contains_key(h));
        let mut queue_refs: HashMap<&str, usize> = HashMap::new();
        for inject in self.queued.values() {
            *queue_refs.entry(inject.peer_id.as_str()).or_insert(0) += 1;
        }
        let queues_match = queue_refs.len() == self.queues.len()
            && queue_refs
                .iter()
                .all(|(peer, n)| self.queues.get(*peer) == Some(n));
        counts_match && disjoint && queues_match
    }
}

fn decrement(counts: &mut HashMap<String, usize>, peer: &str) {
    if let Some(count) = counts.get_mut(peer) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(peer);
        }
    }
}
