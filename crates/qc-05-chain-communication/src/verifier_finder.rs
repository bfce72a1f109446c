//! # Verifier Finder
//!
//! Repairs the verifier peer graph after a rotation. A verifier that is
//! short of current or next verifier peers asks the verifier-boot nodes for
//! their contact URLs and dials the ones it is not connected to.
//!
//! ## Flow
//!
//! ```text
//! block inserted → can_find? → organize sets → (miss_cur, miss_next)
//!     → for each boot: GetVerifiersConnFromBootNode → wait (15 s)
//!         → dial returned URLs not yet connected → stop once satisfied
//! ```
//!
//! Responses are matched to requests by id. A response whose request has
//! already timed out is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::domain::{
    CommError, GetVerifiersReq, GetVerifiersResp, Msg, NodeUrl, Peer, BOOT_NODE_VERIFIERS_CONN,
    GET_VERIFIERS_CONN_FROM_BOOT_NODE,
};
use crate::ports::{
    AbsPeerManager, ChainReader, CommunicationExecutable, CommunicationService, P2PServer,
    PeerManager,
};

/// Whether the local chain is in a state where the verifier graph can be
/// repaired: a best peer exists, the local head is at most two blocks behind
/// it and the current block is not a change point.
pub fn can_find(pm: &dyn PeerManager, chain: &dyn ChainReader) -> Result<(), CommError> {
    let best = pm.best_peer().ok_or(CommError::NoBestPeerFound)?;
    let remote = best.head().height;
    let current = chain.current_block();
    let local = current.number();

    if local + 2 < remote {
        debug!(local, remote, "height too low to find verifiers");
        return Err(CommError::CurrentHeightTooLow { local, remote });
    }
    if chain.is_change_point(&current) {
        return Err(CommError::IsChangePoint);
    }
    Ok(())
}

// =============================================================================
// REQUEST CORRELATION
// =============================================================================

/// Matches boot-node responses to outstanding requests.
#[derive(Default)]
pub struct VfFetcher {
    pending: Mutex<HashMap<u64, oneshot::Sender<GetVerifiersResp>>>,
    last_id: AtomicU64,
}

impl VfFetcher {
    /// Request ids are wall-clock nanoseconds, bumped to stay unique.
    fn next_id(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let prev = self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_default();
        now.max(prev + 1)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `req` to `peer` and wait for the matching response.
    pub async fn get_verifiers_from_boot(
        &self,
        mut req: GetVerifiersReq,
        peer: &Peer,
        wait: Duration,
    ) -> Option<GetVerifiersResp> {
        req.id = self.next_id();
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().insert(req.id, tx).is_some() {
            warn!(id = req.id, "duplicate verifier conn request id");
        }

        if let Err(e) = peer.send(GET_VERIFIERS_CONN_FROM_BOOT_NODE, &req).await {
            warn!(peer = %peer.node_name(), error = %e, "send verifier conn request to boot failed");
            self.pending.lock().remove(&req.id);
            return None;
        }

        let result = tokio::time::timeout(wait, rx).await;
        self.pending.lock().remove(&req.id);
        match result {
            Ok(Ok(resp)) => Some(resp),
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(peer = %peer.node_name(), "verifier conn request to boot timed out");
                None
            }
        }
    }

    /// Deliver a response. Unknown or late ids are dropped.
    pub fn on_response(&self, resp: GetVerifiersResp) {
        match self.pending.lock().remove(&resp.req_id) {
            Some(tx) => {
                let _ = tx.send(resp);
            }
            None => debug!(id = resp.req_id, "verifier conn response without request dropped"),
        }
    }

    fn clear(&self) {
        self.pending.lock().clear();
    }
}

// =============================================================================
// FINDER
// =============================================================================

struct FindingGuard<'a>(&'a AtomicBool);

impl Drop for FindingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct VerifierFinder {
    chain: Arc<dyn ChainReader>,
    pm: Arc<dyn AbsPeerManager>,
    p2p: Arc<dyn P2PServer>,
    response_timeout: Duration,
    fetcher: VfFetcher,
    finding: AtomicBool,
    started: AtomicBool,
}

impl VerifierFinder {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        pm: Arc<dyn AbsPeerManager>,
        p2p: Arc<dyn P2PServer>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            chain,
            pm,
            p2p,
            response_timeout,
            fetcher: VfFetcher::default(),
            finding: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn fetcher(&self) -> &VfFetcher {
        &self.fetcher
    }

    fn should_find(&self) -> Result<(), CommError> {
        can_find(self.pm.as_ref(), self.chain.as_ref())?;
        if !self.pm.self_is_current_verifier() && !self.pm.self_is_next_verifier() {
            return Err(CommError::NotCurrentOrNextVerifier);
        }
        Ok(())
    }

    /// One repair round. Precondition failures are returned untouched so the
    /// caller can tell them apart from real failures.
    pub async fn find_verifiers(&self) -> Result<(), CommError> {
        if self
            .finding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CommError::AlreadyStarted);
        }
        let _guard = FindingGuard(&self.finding);

        self.should_find()?;

        let (miss_cur, miss_next) = self.pm.have_enough_verifiers(true);
        if miss_cur == 0 && miss_next == 0 {
            debug!("enough verifier peers, not asking boot nodes");
            return Ok(());
        }
        info!(miss_cur, miss_next, "not enough verifier peers");

        let current = self.chain.current_block();
        let slot = self
            .chain
            .get_slot(&current)
            .ok_or(CommError::SlotUnavailable(current.number()))?;
        let req = GetVerifiersReq {
            id: 0,
            cur_miss: miss_cur as u64,
            next_miss: miss_next as u64,
            slot,
        };

        for boot in self.pm.verifier_boot_peers() {
            if self.ask_boot(req, &boot).await {
                break;
            }
        }
        Ok(())
    }

    /// Returns whether the boot's answer covered every missing peer.
    async fn ask_boot(&self, req: GetVerifiersReq, boot: &Peer) -> bool {
        let Some(resp) = self
            .fetcher
            .get_verifiers_from_boot(req, boot, self.response_timeout)
            .await
        else {
            return false;
        };
        if !resp.err_info.is_empty() {
            warn!(boot = %boot.node_name(), info = %resp.err_info, "verifier boot refused request");
            return false;
        }

        let self_id = self.p2p.self_node().id().to_string();
        let cur_ids = peer_ids(self.pm.current_verifier_peers());
        let next_ids = peer_ids(self.pm.next_verifier_peers());

        let dialed_cur = resp
            .cur
            .iter()
            .filter(|raw| self.check_and_connect(&self_id, raw, &cur_ids))
            .count();
        let dialed_next = resp
            .next
            .iter()
            .filter(|raw| self.check_and_connect(&self_id, raw, &next_ids))
            .count();

        dialed_cur as u64 >= req.cur_miss && dialed_next as u64 >= req.next_miss
    }

    fn check_and_connect(&self, self_id: &str, raw: &str, connected: &[String]) -> bool {
        let node = match NodeUrl::parse(raw) {
            Ok(node) => node,
            Err(e) => {
                warn!(url = %raw, error = %e, "bad verifier url from boot node");
                return false;
            }
        };
        if node.id() == self_id || connected.iter().any(|id| id == node.id()) {
            return false;
        }
        info!(node = %node, "dialing verifier from boot node");
        self.p2p.add_peer(node);
        true
    }
}

fn peer_ids(peers: Vec<Arc<Peer>>) -> Vec<String> {
    peers.iter().map(|p| p.id().to_string()).collect()
}

#[async_trait]
impl CommunicationService for VerifierFinder {
    fn msg_codes(&self) -> Vec<u64> {
        vec![BOOT_NODE_VERIFIERS_CONN]
    }

    async fn handle_msg(&self, msg: Msg, _peer: Arc<Peer>) -> Result<(), CommError> {
        let resp: GetVerifiersResp = msg.decode()?;
        self.fetcher.on_response(resp);
        Ok(())
    }
}

impl CommunicationExecutable for VerifierFinder {
    fn start(&self) -> Result<(), CommError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(CommError::AlreadyStarted);
        }
        Ok(())
    }

    fn stop(&self) {
        self.fetcher.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SelfRole;
    use crate::ports::PeerConnection;
    use crate::test_utils::{typed_peer_with_conn, CoreFixture, MockConnection};
    use shared_types::{NodeType, ZERO_ADDRESS};

    const SELF_ADDR: [u8; 20] = [9u8; 20];

    fn fixture() -> CoreFixture {
        // Three verifiers per slot: two current peers expected.
        let f = CoreFixture::new(SelfRole::Verifier, SELF_ADDR, 3, &["b001", "b002"]);
        f.verifiers
            .set_current(vec![SELF_ADDR, [1u8; 20], [2u8; 20]]);
        f.chain.set_slot(f.chain.current_block().number(), 10);
        f
    }

    fn finder(f: &CoreFixture) -> Arc<VerifierFinder> {
        Arc::new(VerifierFinder::new(
            f.chain.clone(),
            f.core.clone(),
            f.p2p.clone(),
            Duration::from_secs(15),
        ))
    }

    fn connect_boot(f: &CoreFixture, id: &str) -> Arc<MockConnection> {
        let (local, remote) = MockConnection::pair();
        let peer = typed_peer_with_conn(id, NodeType::VerifierBoot, ZERO_ADDRESS, local);
        peer.set_head([1u8; 32], f.chain.current_block().number());
        f.core.add_peer(peer).unwrap();
        remote
    }

    /// Connect a complete next set so only current peers are missing.
    fn fill_next(f: &CoreFixture) {
        let next = [[3u8; 20], [4u8; 20]];
        f.verifiers.set_next(next.to_vec());
        for (i, address) in next.into_iter().enumerate() {
            let (local, _remote) = MockConnection::pair();
            let peer = typed_peer_with_conn(&format!("d00{i}"), NodeType::Verifier, address, local);
            peer.set_head([1u8; 32], f.chain.current_block().number());
            f.core.add_peer(peer).unwrap();
        }
    }

    #[test]
    fn test_can_find_requires_best_peer() {
        let f = fixture();
        let err = can_find(f.core.as_ref(), f.chain.as_ref()).unwrap_err();
        assert!(matches!(err, CommError::NoBestPeerFound));
    }

    #[test]
    fn test_can_find_rejects_lagging_chain() {
        let f = fixture();
        let (local, _remote) = MockConnection::pair();
        let peer = typed_peer_with_conn("n1", NodeType::Normal, ZERO_ADDRESS, local);
        peer.set_head([1u8; 32], f.chain.current_block().number() + 3);
        f.core.add_peer(peer).unwrap();

        let err = can_find(f.core.as_ref(), f.chain.as_ref()).unwrap_err();
        assert!(matches!(err, CommError::CurrentHeightTooLow { .. }));
    }

    #[test]
    fn test_can_find_rejects_change_point() {
        let f = fixture();
        let _boot = connect_boot(&f, "b001");
        f.chain.mark_change_point(f.chain.current_block().number(), 10);
        let err = can_find(f.core.as_ref(), f.chain.as_ref()).unwrap_err();
        assert!(matches!(err, CommError::IsChangePoint));
    }

    #[tokio::test]
    async fn test_not_verifier_skips() {
        let f = fixture();
        f.verifiers.set_current(vec![[1u8; 20], [2u8; 20]]);
        let _boot = connect_boot(&f, "b001");
        let err = finder(&f).find_verifiers().await.unwrap_err();
        assert!(matches!(err, CommError::NotCurrentOrNextVerifier));
    }

    #[tokio::test]
    async fn test_first_boot_satisfies_missing_peers() {
        let f = fixture();
        fill_next(&f);
        let boot1 = connect_boot(&f, "b001");
        let boot2 = connect_boot(&f, "b002");
        let finder = finder(&f);

        let task = {
            let finder = finder.clone();
            tokio::spawn(async move { finder.find_verifiers().await })
        };

        let msg = boot1.read_msg().await.unwrap();
        assert_eq!(msg.code, GET_VERIFIERS_CONN_FROM_BOOT_NODE);
        let req: GetVerifiersReq = msg.decode().unwrap();
        assert_eq!(req.cur_miss, 2);
        assert_eq!(req.next_miss, 0);
        assert_eq!(req.slot, 10);

        let resp = GetVerifiersResp {
            req_id: req.id,
            cur: vec![
                f.self_node.to_string(),
                "enode://c001@10.0.0.1:30303".into(),
                "enode://c002@10.0.0.2:30303".into(),
            ],
            next: vec![],
            err_info: String::new(),
        };
        let peer = f.core.get_peer("b001").unwrap();
        finder
            .handle_msg(Msg::encode(BOOT_NODE_VERIFIERS_CONN, &resp), peer)
            .await
            .unwrap();

        task.await.unwrap().unwrap();
        let dialed: Vec<String> = f.p2p.added().iter().map(|u| u.id().to_string()).collect();
        assert_eq!(dialed, vec!["c001", "c002"]);
        assert!(boot2.try_read_msg().is_none());
        assert_eq!(finder.fetcher().pending_len(), 0);
    }

    #[tokio::test]
    async fn test_refused_request_moves_to_next_boot() {
        let f = fixture();
        fill_next(&f);
        let boot1 = connect_boot(&f, "b001");
        let boot2 = connect_boot(&f, "b002");
        let finder = finder(&f);

        let task = {
            let finder = finder.clone();
            tokio::spawn(async move { finder.find_verifiers().await })
        };

        let req: GetVerifiersReq = boot1.read_msg().await.unwrap().decode().unwrap();
        finder.fetcher().on_response(GetVerifiersResp {
            req_id: req.id,
            err_info: "slot not match".into(),
            ..Default::default()
        });

        let req: GetVerifiersReq = boot2.read_msg().await.unwrap().decode().unwrap();
        finder.fetcher().on_response(GetVerifiersResp {
            req_id: req.id,
            cur: vec!["enode://c001@10.0.0.1:30303".into()],
            ..Default::default()
        });

        task.await.unwrap().unwrap();
        assert_eq!(f.p2p.added().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_dropped() {
        let f = fixture();
        let boot = connect_boot(&f, "b001");
        let finder = finder(&f);

        let task = {
            let finder = finder.clone();
            tokio::spawn(async move { finder.find_verifiers().await })
        };
        let req: GetVerifiersReq = boot.read_msg().await.unwrap().decode().unwrap();
        task.await.unwrap().unwrap();

        finder.fetcher().on_response(GetVerifiersResp {
            req_id: req.id,
            cur: vec!["enode://c001@10.0.0.1:30303".into()],
            ..Default::default()
        });
        assert!(f.p2p.added().is_empty());
        assert_eq!(finder.fetcher().pending_len(), 0);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let fetcher = VfFetcher::default();
        let a = fetcher.next_id();
        let b = fetcher.next_id();
        assert!(b > a);
    }
}
