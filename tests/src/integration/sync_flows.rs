//! # Block Sync Flows
//!
//! Hash-first propagation of verified blocks, the per-peer announcement
//! limit of the fetcher, and catch-up through the downloader.
//!
//! ## Flows Tested:
//!
//! 1. **Announce → fetch → import**: a hash announcement is turned into a
//!    `GetVerifyResult` request, the delivered bundle is saved once and then
//!    pushed to the peers that do not have it.
//! 2. **DOS limit**: the 257th outstanding announcement of one peer is
//!    refused without touching its counter.
//! 3. **Downloader**: a node at height 100 pulls 101..=103 from a peer at 103.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use qc_05_chain_communication::fetcher::{Announce, FetcherState, NotifyOutcome};
    use qc_05_chain_communication::config::FetcherConfig;
    use qc_05_chain_communication::test_utils::{wait_until, MemoryChain, NoopRequest};
    use qc_05_chain_communication::{
        BlockHashMsg, ChainReader, Msg, PeerConnection, GET_VERIFY_RESULT_MSG,
        VERIFY_BLOCK_HASH_RESULT_MSG, VERIFY_BLOCK_RESULT_MSG,
    };
    use shared_types::{CatchupBundle, NodeType};
    use tokio::time::Instant;

    use crate::integration::{attach_scripted, connect, read_until, remote_handshake, NodeSetup};

    // =========================================================================
    // SCENARIO 1: ANNOUNCE → FETCH → IMPORT
    // =========================================================================

    #[tokio::test]
    async fn test_hash_announce_is_fetched_imported_and_relayed() {
        let node = NodeSetup::normal("aa01", MemoryChain::new(10)).build();
        let source = MemoryChain::extending(&node.chain, 1);
        let bundle = source.bundle_at(11);

        let announcer = attach_scripted(
            &node,
            "dd01",
            remote_handshake(&node, "dd01", NodeType::Normal),
            None,
        )
        .await;
        let bystander = attach_scripted(
            &node,
            "ee01",
            remote_handshake(&node, "ee01", NodeType::Normal),
            None,
        )
        .await;
        assert!(wait_until(|| node.has_peer("dd01") && node.has_peer("ee01")).await);

        let announced_at = Instant::now();
        announcer
            .conn
            .write_msg(Msg::encode(
                VERIFY_BLOCK_HASH_RESULT_MSG,
                &BlockHashMsg {
                    block_hash: bundle.hash(),
                    block_number: 11,
                },
            ))
            .await
            .unwrap();

        // The request goes out once the arrive timeout has passed.
        let request = read_until(&announcer.conn, GET_VERIFY_RESULT_MSG).await;
        assert!(announced_at.elapsed() >= Duration::from_millis(400));
        assert_eq!(request.decode::<u64>().unwrap(), 11);

        announcer
            .conn
            .write_msg(Msg::encode(VERIFY_BLOCK_RESULT_MSG, &bundle))
            .await
            .unwrap();
        assert!(wait_until(|| node.chain.current_block().number() == 11).await);
        assert_eq!(node.chain.saved(), vec![11]);
        assert_eq!(node.chain.get_seen_commits(11), Some(bundle.seen_commits.clone()));

        // Post-import broadcast reaches the peer that did not know the block.
        let relayed: CatchupBundle = read_until(&bystander.conn, VERIFY_BLOCK_RESULT_MSG)
            .await
            .decode()
            .unwrap();
        assert_eq!(relayed, bundle);

        tokio::time::sleep(Duration::from_millis(100)).await;
        while let Some(msg) = announcer.conn.try_read_msg() {
            assert_ne!(msg.code, VERIFY_BLOCK_RESULT_MSG, "block echoed to its announcer");
        }
    }

    #[tokio::test]
    async fn test_stale_announce_is_not_fetched() {
        let node = NodeSetup::normal("aa01", MemoryChain::new(10)).build();
        let announcer = attach_scripted(
            &node,
            "dd01",
            remote_handshake(&node, "dd01", NodeType::Normal),
            None,
        )
        .await;
        assert!(wait_until(|| node.has_peer("dd01")).await);

        let known = node.chain.bundle_at(10);
        announcer
            .conn
            .write_msg(Msg::encode(
                VERIFY_BLOCK_HASH_RESULT_MSG,
                &BlockHashMsg {
                    block_hash: known.hash(),
                    block_number: 10,
                },
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(800)).await;
        while let Some(msg) = announcer.conn.try_read_msg() {
            assert_ne!(msg.code, GET_VERIFY_RESULT_MSG);
        }
        assert!(node.chain.saved().is_empty());
    }

    // =========================================================================
    // SCENARIO 2: DOS LIMIT
    // =========================================================================

    #[test]
    fn test_hash_limit_refuses_257th_announcement() {
        let config = FetcherConfig::default();
        let limit = config.hash_limit;
        let mut state = FetcherState::new(config);
        let now = Instant::now();

        let announce = |seed: u64| {
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&seed.to_be_bytes());
            Announce {
                hash,
                number: 11,
                peer_id: "flooder".to_string(),
                time: now,
                request: Arc::new(NoopRequest),
            }
        };

        for seed in 0..limit as u64 {
            assert_eq!(state.notify(announce(seed), 10), NotifyOutcome::Accepted);
        }
        assert_eq!(state.notify_count("flooder"), 256);

        assert_eq!(state.notify(announce(256), 10), NotifyOutcome::HashLimit);
        assert_eq!(state.notify_count("flooder"), 256);
        assert!(state.notified_len() <= 256);
        assert!(state.is_consistent());
    }

    // =========================================================================
    // SCENARIO 3: DOWNLOADER
    // =========================================================================

    #[tokio::test]
    async fn test_downloader_catches_up_in_order() {
        let behind = NodeSetup::normal("aa01", MemoryChain::new(100)).build();
        let ahead_chain = MemoryChain::extending(&behind.chain, 3);
        let ahead = NodeSetup::normal("bb01", ahead_chain).build();

        connect(&behind, &ahead).await;

        assert!(wait_until(|| behind.chain.current_block().number() == 103).await);
        assert_eq!(behind.chain.saved(), vec![101, 102, 103]);
        assert_eq!(
            behind.chain.current_block(),
            ahead.chain.current_block()
        );
        // The node that was ahead never imports anything.
        assert!(ahead.chain.saved().is_empty());
    }
}
