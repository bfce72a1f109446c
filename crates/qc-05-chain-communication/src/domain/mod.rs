//! # Domain Layer
//!
//! Peer bookkeeping, wire messages and handshake rules. Nothing in here
//! spawns tasks; the protocol and service layers drive it.

pub mod errors;
pub mod handshake;
pub mod messages;
pub mod node;
pub mod peer;
pub mod peer_set;
pub mod peer_set_manager;

pub use errors::*;
pub use handshake::{address_from_pubkey, make_status, recover_sender, verify_remote_status, SIGNATURE_LEN};
pub use messages::*;
pub use node::{NodeUrl, PeerClass, SelfRole};
pub use peer::{CsPeerInfo, DisconnectReason, Peer, PeerHead};
pub use peer_set::PeerSet;
pub use peer_set_manager::{
    CsPmPeerInfo, PeerSetManager, VerifierClassifier, NORMAL_MAX_PEER_COUNT, P2P_MAX_PEER_COUNT,
    PBFT_MAX_PEER_COUNT,
};
