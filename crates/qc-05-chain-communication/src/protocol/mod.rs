//! # Protocol Managers
//!
//! - [`base`]: code → handler registry and lifecycle of hosted services.
//! - [`peer_manager`]: peer sets plus verifier-window predicates.
//! - [`cs`]: the chain-sync protocol (handshake, read loop, background loops).
//! - [`mine`]: the single-set miner ↔ mine-master protocol.

pub mod base;
pub mod cs;
pub mod mine;
pub mod peer_manager;

pub use base::{check_msg_size, BaseProtocolManager};
pub use cs::CsProtocolManager;
pub use mine::MineProtocolManager;
pub use peer_manager::CsPeerManager;

/// Protocol advertised to the p2p server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Protocol {
    pub name: String,
    pub version: u32,
    /// Number of message codes reserved by the protocol.
    pub length: u64,
}
