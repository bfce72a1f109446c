//! # Peer Graph Flows
//!
//! How nodes sort their peers and repair the verifier graph.
//!
//! ## Flows Tested:
//!
//! 4. **Rotation**: re-partitioning base/current/next by address keeps
//!    every connection.
//! 5. **Handshake rejection**: a remote on another network is never
//!    admitted and its connection is closed.
//! 6. **Verifier finding**: a verifier short of current peers asks the first
//!    verifier-boot node, dials the verifiers it names (never itself) and
//!    leaves the second boot node alone.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use qc_05_chain_communication::test_utils::{
        typed_peer, wait_until, MemoryChain, StaticClassifier, StaticVerifiers,
    };
    use qc_05_chain_communication::{
        CommError, PeerSetManager, SelfRole, GET_VERIFIERS_CONN_FROM_BOOT_NODE,
        P2P_MAX_PEER_COUNT,
    };
    use shared_types::NodeType;

    use crate::integration::{
        address_of, attach_scripted, connect, remote_handshake, Node, NodeSetup,
    };

    // =========================================================================
    // SCENARIO 4: ROTATION
    // =========================================================================

    #[test]
    fn test_rotation_swaps_roles_without_dropping_peers() {
        let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
        let classifier = StaticClassifier {
            current: vec![[3u8; 20]],
            next: vec![[4u8; 20]],
            boots: Vec::new(),
            self_current: true,
            self_next: true,
        };
        for (id, n) in [("a", 1u8), ("b", 2), ("c", 3), ("d", 4)] {
            psm.add_peer(typed_peer(id, NodeType::Verifier, [n; 20]), &classifier)
                .unwrap();
        }
        assert!(psm.base().contains("a") && psm.base().contains("b"));
        assert!(psm.current_verifiers().contains("c"));
        assert!(psm.next_verifiers().contains("d"));

        let dropped = psm.organize_verifiers_set(&[[2u8; 20]], &[[1u8; 20]]);

        assert_eq!(dropped, 0);
        assert_eq!(psm.current_verifiers().peer_ids(), vec!["b".to_string()]);
        assert_eq!(psm.next_verifiers().peer_ids(), vec!["a".to_string()]);
        assert_eq!(
            psm.base().peer_ids(),
            vec!["c".to_string(), "d".to_string()]
        );
        assert_eq!(psm.peer_count(), 4);
        for id in ["a", "b", "c", "d"] {
            assert!(psm.get_peer(id).unwrap().is_running());
        }
    }

    // =========================================================================
    // SCENARIO 5: HANDSHAKE REJECTION
    // =========================================================================

    #[tokio::test]
    async fn test_foreign_network_is_rejected() {
        let node = NodeSetup::normal("aa01", MemoryChain::new(5)).build();
        let mut handshake = remote_handshake(&node, "dd01", NodeType::Normal);
        handshake.network_id += 1;

        let remote = attach_scripted(&node, "dd01", handshake, None).await;
        let err = remote.task.await.unwrap().unwrap_err();

        assert!(matches!(err, CommError::NetworkIdMismatch { .. }));
        assert!(!node.has_peer("dd01"));
        assert!(node.manager.core().psm().base().is_empty());
        assert!(remote.conn.is_closed());
    }

    #[tokio::test]
    async fn test_foreign_genesis_is_rejected() {
        let node = NodeSetup::normal("aa01", MemoryChain::new(5)).build();
        let mut handshake = remote_handshake(&node, "dd01", NodeType::Normal);
        handshake.genesis_block = [0xee; 32];

        let remote = attach_scripted(&node, "dd01", handshake, None).await;
        let err = remote.task.await.unwrap().unwrap_err();

        assert!(matches!(err, CommError::GenesisMismatch));
        assert!(!node.has_peer("dd01"));
    }

    // =========================================================================
    // SCENARIO 6: VERIFIER FINDING
    // =========================================================================

    const SELF_KEY: u8 = 1;
    const BOOT_KEYS: [u8; 2] = [5, 6];

    fn verifier_setup(id: &'static str, key: u8, verifiers: &Arc<StaticVerifiers>) -> NodeSetup {
        NodeSetup {
            id,
            node_type: NodeType::Verifier,
            chain: MemoryChain::new(10),
            verifiers: verifiers.clone(),
            verifier_boots: vec!["b001", "b002"],
            verifier_number: 3,
            key: Some(key),
        }
    }

    #[tokio::test]
    async fn test_verifier_finds_missing_peers_through_first_boot() {
        let addresses: Vec<_> = [SELF_KEY, 2, 3].into_iter().map(address_of).collect();
        let verifiers = Arc::new(StaticVerifiers::new(addresses.clone(), addresses));

        let me = verifier_setup("a001", SELF_KEY, &verifiers).build();
        let c1 = verifier_setup("c001", 2, &verifiers).build();
        let c2 = verifier_setup("c002", 3, &verifiers).build();
        let boot = NodeSetup {
            node_type: NodeType::VerifierBoot,
            ..verifier_setup("b001", BOOT_KEYS[0], &verifiers)
        }
        .build();

        connect(&c1, &boot).await;
        connect(&c2, &boot).await;
        connect(&me, &boot).await;
        let second_boot = attach_scripted(
            &me,
            "b002",
            remote_handshake(&me, "b002", NodeType::VerifierBoot),
            Some(BOOT_KEYS[1]),
        )
        .await;
        assert!(wait_until(|| me.has_peer("b002")).await);
        assert_eq!(me.manager.core().psm().verifier_boots().len(), 2);
        assert_eq!(boot.manager.core().psm().current_verifiers().len(), 3);

        // A new local block triggers a repair round.
        me.chain.push_block();

        assert!(
            wait_until(|| {
                let dialed = me.dialed();
                dialed.contains(&"c001".to_string()) && dialed.contains(&"c002".to_string())
            })
            .await
        );
        assert!(!me.dialed().contains(&"a001".to_string()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        while let Some(msg) = second_boot.conn.try_read_msg() {
            assert_ne!(msg.code, GET_VERIFIERS_CONN_FROM_BOOT_NODE, "second boot was queried");
        }
    }
}
