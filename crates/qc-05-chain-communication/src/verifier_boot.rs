//! # Verifier Boot Service
//!
//! Server side of verifier discovery, hosted by verifier-boot nodes. Answers
//! `GetVerifiersConnFromBootNode` with the contact URLs of the verifier
//! peers this node is connected to.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::domain::{
    CommError, GetVerifiersReq, GetVerifiersResp, Msg, Peer, BOOT_NODE_VERIFIERS_CONN,
    GET_VERIFIERS_CONN_FROM_BOOT_NODE,
};
use crate::ports::{AbsPeerManager, ChainReader, CommunicationService};
use crate::verifier_finder::can_find;

pub struct VerifierBootService {
    chain: Arc<dyn ChainReader>,
    pm: Arc<dyn AbsPeerManager>,
}

impl VerifierBootService {
    pub fn new(chain: Arc<dyn ChainReader>, pm: Arc<dyn AbsPeerManager>) -> Self {
        Self { chain, pm }
    }

    /// Build the answer to `req` from `from`. Refusals carry `err_info`.
    pub fn answer(&self, req: &GetVerifiersReq, from: &Peer) -> GetVerifiersResp {
        let mut resp = GetVerifiersResp {
            req_id: req.id,
            ..Default::default()
        };

        if let Err(e) = can_find(self.pm.as_ref(), self.chain.as_ref()) {
            resp.err_info = e.to_string();
            return resp;
        }

        let current = self.chain.current_block();
        let Some(slot) = self.chain.get_slot(&current) else {
            resp.err_info = CommError::SlotUnavailable(current.number()).to_string();
            return resp;
        };
        if slot != req.slot {
            warn!(req_slot = req.slot, boot_slot = slot, from = %from.node_name(), "slot not match");
            resp.err_info = format!("slot not match, req.slot: {}, boot.slot: {}", req.slot, slot);
            return resp;
        }

        let urls_except_requester = |peers: Vec<Arc<Peer>>| -> Vec<String> {
            peers
                .into_iter()
                .filter(|p| p.id() != from.id())
                .map(|p| p.raw_url())
                .collect()
        };
        if req.cur_miss > 0 {
            resp.cur = urls_except_requester(self.pm.current_verifier_peers());
        }
        if req.next_miss > 0 {
            resp.next = urls_except_requester(self.pm.next_verifier_peers());
        }
        resp
    }
}

#[async_trait]
impl CommunicationService for VerifierBootService {
    fn msg_codes(&self) -> Vec<u64> {
        vec![GET_VERIFIERS_CONN_FROM_BOOT_NODE]
    }

    async fn handle_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError> {
        let req: GetVerifiersReq = msg.decode()?;
        let resp = self.answer(&req, &peer);
        debug!(
            from = %peer.node_name(),
            cur = resp.cur.len(),
            next = resp.next.len(),
            refused = !resp.err_info.is_empty(),
            "answering verifier conn request"
        );
        if let Err(e) = peer.send(BOOT_NODE_VERIFIERS_CONN, &resp).await {
            warn!(peer = %peer.node_name(), error = %e, "send verifier conns failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SelfRole;
    use crate::ports::PeerConnection;
    use crate::test_utils::{typed_peer_with_conn, CoreFixture, MockConnection};
    use shared_types::NodeType;

    fn fixture() -> CoreFixture {
        let f = CoreFixture::new(SelfRole::Boot, [0u8; 20], 4, &["aa00"]);
        f.verifiers
            .set_current(vec![[1u8; 20], [2u8; 20], [3u8; 20]]);
        f.verifiers.set_next(vec![[4u8; 20]]);
        f.chain.set_slot(f.chain.current_block().number(), 7);
        f
    }

    fn connect_verifier(f: &CoreFixture, id: &str, address: [u8; 20]) -> Arc<Peer> {
        let (local, _remote) = MockConnection::pair();
        let peer = typed_peer_with_conn(id, NodeType::Verifier, address, local);
        peer.set_head([1u8; 32], f.chain.current_block().number());
        peer.set_raw_url(format!("enode://{id}@10.0.0.1:30303"));
        f.core.add_peer(peer.clone()).unwrap();
        peer
    }

    fn request(slot: u64) -> GetVerifiersReq {
        GetVerifiersReq {
            id: 77,
            cur_miss: 2,
            next_miss: 1,
            slot,
        }
    }

    #[test]
    fn test_answer_excludes_requester() {
        let f = fixture();
        let requester = connect_verifier(&f, "c001", [1u8; 20]);
        connect_verifier(&f, "c002", [2u8; 20]);
        connect_verifier(&f, "c003", [3u8; 20]);
        connect_verifier(&f, "c004", [4u8; 20]);

        let service = VerifierBootService::new(f.chain.clone(), f.core.clone());
        let resp = service.answer(&request(7), &requester);
        assert_eq!(resp.req_id, 77);
        assert!(resp.err_info.is_empty());
        assert_eq!(
            resp.cur,
            vec![
                "enode://c002@10.0.0.1:30303".to_string(),
                "enode://c003@10.0.0.1:30303".to_string()
            ]
        );
        assert_eq!(resp.next, vec!["enode://c004@10.0.0.1:30303".to_string()]);
    }

    #[test]
    fn test_slot_mismatch_refused() {
        let f = fixture();
        let requester = connect_verifier(&f, "c001", [1u8; 20]);
        let service = VerifierBootService::new(f.chain.clone(), f.core.clone());
        let resp = service.answer(&request(8), &requester);
        assert!(resp.err_info.contains("slot not match"));
        assert!(resp.cur.is_empty());
    }

    #[test]
    fn test_no_best_peer_refused() {
        let f = fixture();
        let (local, _remote) = MockConnection::pair();
        let stranger = Peer::new("zz", 1, local);
        let service = VerifierBootService::new(f.chain.clone(), f.core.clone());
        let resp = service.answer(&request(7), &stranger);
        assert_eq!(resp.err_info, CommError::NoBestPeerFound.to_string());
    }

    #[tokio::test]
    async fn test_replies_on_same_connection() {
        let f = fixture();
        connect_verifier(&f, "c002", [2u8; 20]);
        let (local, remote) = MockConnection::pair();
        let requester = typed_peer_with_conn("c001", NodeType::Verifier, [1u8; 20], local);

        let service = VerifierBootService::new(f.chain.clone(), f.core.clone());
        service
            .handle_msg(
                Msg::encode(GET_VERIFIERS_CONN_FROM_BOOT_NODE, &request(7)),
                requester,
            )
            .await
            .unwrap();

        let reply = remote.read_msg().await.unwrap();
        assert_eq!(reply.code, BOOT_NODE_VERIFIERS_CONN);
        let resp: GetVerifiersResp = reply.decode().unwrap();
        assert_eq!(resp.cur, vec!["enode://c002@10.0.0.1:30303".to_string()]);
    }
}
