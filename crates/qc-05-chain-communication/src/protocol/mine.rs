//! # Mine Protocol Manager
//!
//! Miner side of the miner ↔ mine-master link. One flat peer set, no
//! verifier logic; every message goes to the injected handler.

use std::sync::Arc;

use tracing::{info, warn};

use super::base::check_msg_size;
use super::Protocol;
use crate::config::{CS_PROTOCOL_LENGTH, MINE_PROTOCOL_NAME, MINE_PROTOCOL_VERSION};
use crate::domain::{CommError, DisconnectReason, Peer, PeerSet, P2P_MAX_PEER_COUNT};
use crate::ports::MineMsgHandler;

pub struct MineProtocolManager {
    max_peers: usize,
    peers: PeerSet,
    handler: Arc<dyn MineMsgHandler>,
}

impl MineProtocolManager {
    pub fn new(handler: Arc<dyn MineMsgHandler>) -> Self {
        Self {
            max_peers: P2P_MAX_PEER_COUNT,
            peers: PeerSet::new(),
            handler,
        }
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn protocol(&self) -> Protocol {
        Protocol {
            name: MINE_PROTOCOL_NAME.to_string(),
            version: MINE_PROTOCOL_VERSION,
            length: CS_PROTOCOL_LENGTH,
        }
    }

    /// Run one mine-master connection until it fails.
    pub async fn handle(&self, peer: Arc<Peer>) -> Result<(), CommError> {
        if self.peers.len() >= self.max_peers {
            peer.disconnect(DisconnectReason::TooManyPeers);
            return Err(CommError::TooManyPeers);
        }

        self.handler.set_mine_master_peer(peer.clone());
        if let Err(e) = self.peers.add_peer_capped(peer.clone(), self.max_peers) {
            warn!(peer = %peer.id(), error = %e, "mine peer set add failed");
            peer.disconnect(DisconnectReason::AlreadyConnected);
            return Err(e);
        }
        info!(peer = %peer.id(), "mine master connected");

        let result = loop {
            if let Err(e) = self.handle_msg(&peer).await {
                info!(peer = %peer.id(), error = %e, "mine peer failed, removing");
                break Err(e);
            }
        };

        self.remove_peer(peer.id());
        result
    }

    async fn handle_msg(&self, peer: &Arc<Peer>) -> Result<(), CommError> {
        let msg = peer.read_msg().await?;
        check_msg_size(&msg)?;
        if let Err(e) = self.handler.on_new_msg(msg, peer.clone()).await {
            peer.set_not_running();
            return Err(e);
        }
        Ok(())
    }

    fn remove_peer(&self, id: &str) {
        if let Ok(peer) = self.peers.remove_peer(id) {
            peer.disconnect(DisconnectReason::Requested);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Msg;
    use crate::ports::PeerConnection;
    use crate::test_utils::{wait_until, MockConnection, MockMineHandler};

    #[tokio::test]
    async fn test_messages_reach_handler() {
        let handler = Arc::new(MockMineHandler::default());
        let pm = Arc::new(MineProtocolManager::new(handler.clone()));
        let (local, remote) = MockConnection::pair();
        let peer = Arc::new(Peer::new("m1", 1, local.clone()));

        let task = {
            let pm = pm.clone();
            tokio::spawn(async move { pm.handle(peer).await })
        };

        remote.write_msg(Msg::new(0x20, vec![1, 2])).await.unwrap();
        assert!(wait_until(|| handler.received() == vec![0x20]).await);
        assert_eq!(handler.master().as_deref(), Some("m1"));
        assert!(pm.peers().contains("m1"));

        remote.disconnect(DisconnectReason::Requested);
        assert!(task.await.unwrap().is_err());
        assert!(!pm.peers().contains("m1"));
        assert!(local.is_closed());
    }

    #[tokio::test]
    async fn test_handler_error_ends_loop() {
        let handler = Arc::new(MockMineHandler::failing());
        let pm = MineProtocolManager::new(handler);
        let (local, remote) = MockConnection::pair();
        let peer = Arc::new(Peer::new("m1", 1, local));

        remote.write_msg(Msg::new(0x20, vec![])).await.unwrap();
        assert!(pm.handle(peer.clone()).await.is_err());
        assert!(!peer.is_running());
        assert!(pm.peers().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let handler = Arc::new(MockMineHandler::default());
        let pm = MineProtocolManager::new(handler.clone());
        let (local, remote) = MockConnection::pair();
        let peer = Arc::new(Peer::new("m1", 1, local));

        let mut msg = Msg::new(0x20, vec![]);
        msg.size = crate::domain::PROTOCOL_MAX_MSG_SIZE + 1;
        remote.write_msg(msg).await.unwrap();

        let err = pm.handle(peer).await.unwrap_err();
        assert!(matches!(err, CommError::MessageTooLarge { .. }));
        assert!(handler.received().is_empty());
    }
}
