//! # Chain Communication Subsystem (qc-05)
//!
//! Peer classification, block and transaction dissemination, verifier
//! discovery and catch-up sync for a BFT node.
//!
//! ## Architecture Role
//!
//! ```text
//!                       [P2P server] ──Peer──→ CsProtocolManager
//!                                                 │ handshake, classify
//!                                                 ↓
//!              ┌──────────── CsPeerManager (base / current / next / boots)
//!              │                                  │ dispatch by msg code
//!              ↓                                  ↓
//!   VerifierFinder / BootService     Block/Verified/Tx broadcasters, Downloader
//!                                                 │
//!                                                 ↓
//!                                  BlockFetcher ──save──→ [Chain store]
//! ```
//!
//! ## Roles
//!
//! - Normal and mine-master nodes keep one base peer set.
//! - Verifiers additionally keep current/next verifier sets and search for
//!   missing verifiers through the verifier-boot nodes.
//! - Verifier-boot nodes answer those searches.
//! - Miners speak only the mine protocol to their mine master.

pub mod adapters;
pub mod broadcast;
pub mod builder;
pub mod config;
pub mod domain;
pub mod downloader;
pub mod fetcher;
pub mod logging;
pub mod ports;
pub mod protocol;
pub mod verifier_boot;
pub mod verifier_finder;

/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use adapters::{CacheDb, InMemoryKvStore, LocalSigner};
pub use broadcast::{BlockBroadcaster, TxBroadcaster, VerifiedBlockBroadcaster};
pub use builder::{make_cs_protocol_manager, BroadcastDelegate, ChainCommDeps};
pub use config::{BootEnv, ChainCommConfig, ConfigError};
pub use domain::*;
pub use downloader::{Downloader, SyncOutcome};
pub use fetcher::{BlockFetcher, FetcherHandle};
pub use logging::init_logging;
pub use ports::*;
pub use protocol::{
    BaseProtocolManager, CsPeerManager, CsProtocolManager, MineProtocolManager, Protocol,
};
pub use verifier_boot::VerifierBootService;
pub use verifier_finder::VerifierFinder;
