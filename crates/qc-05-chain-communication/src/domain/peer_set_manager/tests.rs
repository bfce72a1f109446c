use super::*;
use crate::test_utils::{test_peer, typed_peer, StaticClassifier};
use proptest::prelude::*;

fn addr(n: u8) -> Address {
    [n; 20]
}

fn verifier_classifier(current: &[u8], next: &[u8]) -> StaticClassifier {
    StaticClassifier {
        current: current.iter().map(|n| addr(*n)).collect(),
        next: next.iter().map(|n| addr(*n)).collect(),
        boots: vec!["b0".into()],
        self_current: true,
        self_next: true,
    }
}

// =============================================================================
// ADMISSION
// =============================================================================

#[test]
fn test_base_role_caps_at_max_peers() {
    let psm = PeerSetManager::new(SelfRole::Base, 2);
    let c = StaticClassifier::default();
    psm.add_peer(test_peer("a1", 1), &c).unwrap();
    psm.add_peer(typed_peer("a2", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    assert!(psm.check_conn_count());
    assert!(matches!(
        psm.add_peer(test_peer("a3", 1), &c),
        Err(CommError::TooManyPeers)
    ));
    assert_eq!(psm.base().len(), 2);
}

#[test]
fn test_verifier_role_reserves_verifier_slots() {
    let psm = PeerSetManager::new(SelfRole::Verifier, PBFT_MAX_PEER_COUNT + 1);
    let c = verifier_classifier(&[], &[]);
    psm.add_peer(test_peer("n1", 1), &c).unwrap();
    assert!(matches!(
        psm.add_peer(typed_peer("n2", NodeType::MineMaster, addr(0)), &c),
        Err(CommError::TooManyPeers)
    ));
}

#[test]
fn test_verifier_role_routes_verifiers() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[1, 3], &[2, 3]);

    let joined = psm
        .add_peer(typed_peer("v1", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::CurrentVerifier]);

    let joined = psm
        .add_peer(typed_peer("v2", NodeType::Verifier, addr(2)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::NextVerifier]);

    let joined = psm
        .add_peer(typed_peer("v3", NodeType::Verifier, addr(3)), &c)
        .unwrap();
    assert_eq!(
        joined,
        vec![PeerClass::CurrentVerifier, PeerClass::NextVerifier]
    );

    let joined = psm
        .add_peer(typed_peer("v9", NodeType::Verifier, addr(9)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::Base]);
}

#[test]
fn test_verifier_outside_window_goes_to_base() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let mut c = verifier_classifier(&[1], &[1]);
    c.self_current = false;
    c.self_next = false;
    let joined = psm
        .add_peer(typed_peer("v1", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::Base]);
}

#[test]
fn test_self_current_only_ignores_next_match() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let mut c = verifier_classifier(&[], &[1]);
    c.self_next = false;
    let joined = psm
        .add_peer(typed_peer("v1", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::Base]);
}

#[test]
fn test_boot_role_skips_self_checks() {
    let psm = PeerSetManager::new(SelfRole::Boot, P2P_MAX_PEER_COUNT);
    let mut c = verifier_classifier(&[1], &[]);
    c.self_current = false;
    c.self_next = false;
    let joined = psm
        .add_peer(typed_peer("v1", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::CurrentVerifier]);
}

#[test]
fn test_verifier_boot_admission() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[], &[]);
    let joined = psm
        .add_peer(typed_peer("b0", NodeType::VerifierBoot, addr(0)), &c)
        .unwrap();
    assert_eq!(joined, vec![PeerClass::VerifierBoot]);

    let joined = psm
        .add_peer(typed_peer("b9", NodeType::VerifierBoot, addr(0)), &c)
        .unwrap();
    assert!(joined.is_empty());
    assert!(!psm.contains("b9"));
}

#[test]
fn test_miner_is_illegal_for_verifier_role() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[], &[]);
    assert!(matches!(
        psm.add_peer(typed_peer("m1", NodeType::Miner, addr(0)), &c),
        Err(CommError::IllegalNodeType(NodeType::Miner))
    ));
}

#[test]
fn test_duplicate_admission_fails_across_sets() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[1], &[]);
    psm.add_peer(typed_peer("v1", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    assert!(matches!(
        psm.add_peer(test_peer("v1", 1), &c),
        Err(CommError::AlreadyPresent(_))
    ));
}

#[test]
fn test_verifier_set_full_admits_nowhere() {
    let psm = PeerSetManager::new(SelfRole::Boot, P2P_MAX_PEER_COUNT);
    let current: Vec<u8> = (1..=PBFT_MAX_PEER_COUNT as u8 + 1).collect();
    let c = verifier_classifier(&current, &[PBFT_MAX_PEER_COUNT as u8 + 1]);
    for n in 1..=PBFT_MAX_PEER_COUNT as u8 {
        psm.add_peer(typed_peer(&format!("v{n}"), NodeType::Verifier, addr(n)), &c)
            .unwrap();
    }
    let last = PBFT_MAX_PEER_COUNT as u8 + 1;
    assert!(matches!(
        psm.add_peer(typed_peer("last", NodeType::Verifier, addr(last)), &c),
        Err(CommError::TooManyPeers)
    ));
    assert!(!psm.next_verifiers().contains("last"));
}

// =============================================================================
// REMOVAL AND LOOKUP
// =============================================================================

#[test]
fn test_remove_peer_clears_every_set() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[1], &[1]);
    let peer = typed_peer("v1", NodeType::Verifier, addr(1));
    psm.add_peer(peer.clone(), &c).unwrap();
    assert!(psm.current_verifiers().contains("v1"));
    assert!(psm.next_verifiers().contains("v1"));

    assert!(psm.remove_peer("v1").is_some());
    assert!(!psm.contains("v1"));
    assert!(!peer.is_running());
    assert!(psm.remove_peer("v1").is_none());
}

#[test]
fn test_best_peer_across_sets() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[1], &[]);
    psm.add_peer(test_peer("n1", 5), &c).unwrap();
    let v = typed_peer("v1", NodeType::Verifier, addr(1));
    v.set_head([1u8; 32], 9);
    psm.add_peer(v, &c).unwrap();
    assert_eq!(psm.best_peer().unwrap().id(), "v1");
}

#[test]
fn test_verifier_role_conn_count() {
    let psm = PeerSetManager::new(SelfRole::Verifier, PBFT_MAX_PEER_COUNT);
    // Base budget is zero, current set is empty.
    assert!(!psm.check_conn_count());
}

// =============================================================================
// ROTATION
// =============================================================================

#[test]
fn test_rotation_swaps_roles() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[3], &[4]);
    let a = typed_peer("a", NodeType::Verifier, addr(1));
    let b = typed_peer("b", NodeType::Verifier, addr(2));
    let cc = typed_peer("c", NodeType::Verifier, addr(3));
    let d = typed_peer("d", NodeType::Verifier, addr(4));
    for p in [&a, &b, &cc, &d] {
        psm.add_peer((*p).clone(), &c).unwrap();
    }
    assert_eq!(psm.base().peer_ids(), vec!["a", "b"]);
    assert_eq!(psm.current_verifiers().peer_ids(), vec!["c"]);
    assert_eq!(psm.next_verifiers().peer_ids(), vec!["d"]);

    let dropped = psm.organize_verifiers_set(&[addr(2)], &[addr(1)]);

    assert_eq!(dropped, 0);
    assert_eq!(psm.current_verifiers().peer_ids(), vec!["b"]);
    assert_eq!(psm.next_verifiers().peer_ids(), vec!["a"]);
    assert_eq!(psm.base().peer_ids(), vec!["c", "d"]);
    assert!(cc.is_running() && d.is_running());
}

#[test]
fn test_rotation_disconnects_base_overflow() {
    let psm = PeerSetManager::new(SelfRole::Base, 200);
    let c = StaticClassifier::default();
    let peers: Vec<_> = (0..NORMAL_MAX_PEER_COUNT + 3)
        .map(|i| test_peer(&format!("p{i:03}"), 1))
        .collect();
    for p in &peers {
        psm.add_peer(p.clone(), &c).unwrap();
    }
    let dropped = psm.organize_verifiers_set(&[], &[]);
    assert_eq!(dropped, 3);
    assert_eq!(psm.base().len(), NORMAL_MAX_PEER_COUNT);
    assert_eq!(peers.iter().filter(|p| !p.is_running()).count(), 3);
}

#[test]
fn test_rotation_leaves_verifier_boots() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[], &[]);
    psm.add_peer(typed_peer("b0", NodeType::VerifierBoot, addr(0)), &c)
        .unwrap();
    psm.organize_verifiers_set(&[], &[]);
    assert!(psm.verifier_boots().contains("b0"));
    assert!(psm.base().is_empty());
}

#[test]
fn test_match_current_to_next() {
    let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
    let c = verifier_classifier(&[1], &[]);
    psm.add_peer(typed_peer("v1", NodeType::Verifier, addr(1)), &c)
        .unwrap();
    psm.add_peer(typed_peer("v2", NodeType::Verifier, addr(2)), &c)
        .unwrap();
    assert!(psm.base().contains("v2"));

    assert_eq!(psm.pick_next_verifiers_from_base(&[addr(1), addr(2)]), 1);
    assert_eq!(psm.add_current_verifiers_to_next(&[addr(1), addr(2)]), 1);

    assert!(!psm.base().contains("v2"));
    assert_eq!(psm.next_verifiers().peer_ids(), vec!["v1", "v2"]);
    assert!(psm.current_verifiers().contains("v1"));
}

// =============================================================================
// PROPERTIES
// =============================================================================

fn node_type_strategy() -> impl Strategy<Value = NodeType> {
    prop_oneof![
        Just(NodeType::Normal),
        Just(NodeType::MineMaster),
        Just(NodeType::Verifier),
        Just(NodeType::VerifierBoot),
    ]
}

proptest! {
    #[test]
    fn prop_sets_stay_disjoint(
        peers in prop::collection::vec((node_type_strategy(), 0u8..8), 1..40),
        current in prop::collection::vec(1u8..8, 0..4),
        next in prop::collection::vec(1u8..8, 0..4),
        rot_current in prop::collection::vec(1u8..8, 0..4),
        rot_next in prop::collection::vec(1u8..8, 0..4),
    ) {
        let psm = PeerSetManager::new(SelfRole::Verifier, P2P_MAX_PEER_COUNT);
        let c = verifier_classifier(&current, &next);
        for (i, (nt, a)) in peers.iter().enumerate() {
            let _ = psm.add_peer(typed_peer(&format!("p{i}"), *nt, addr(*a)), &c);
        }

        let check = |psm: &PeerSetManager| {
            for id in psm.get_peers().keys() {
                let in_base = psm.base().contains(id);
                let in_verifier = psm.current_verifiers().contains(id)
                    || psm.next_verifiers().contains(id);
                let in_boot = psm.verifier_boots().contains(id);
                let memberships = [in_base, in_verifier, in_boot].iter().filter(|b| **b).count();
                prop_assert_eq!(memberships, 1);
            }
            Ok(())
        };
        check(&psm)?;

        let before = psm.peer_count();
        let rc: Vec<Address> = rot_current.iter().map(|n| addr(*n)).collect();
        let rn: Vec<Address> = rot_next.iter().map(|n| addr(*n)).collect();
        let dropped = psm.organize_verifiers_set(&rc, &rn);
        prop_assert_eq!(dropped, 0);
        prop_assert_eq!(psm.peer_count(), before);
        check(&psm)?;
    }

    #[test]
    fn prop_best_peer_is_maximal(heights in prop::collection::vec(0u64..1000, 0..20)) {
        let psm = PeerSetManager::new(SelfRole::Base, P2P_MAX_PEER_COUNT);
        let c = StaticClassifier::default();
        for (i, h) in heights.iter().enumerate() {
            psm.add_peer(test_peer(&format!("p{i}"), *h), &c).unwrap();
        }
        match psm.best_peer() {
            None => prop_assert!(heights.is_empty()),
            Some(best) => prop_assert_eq!(Some(best.head().height), heights.iter().copied().max()),
        }
    }
}
