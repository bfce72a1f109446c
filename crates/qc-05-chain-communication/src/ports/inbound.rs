//! # Inbound Ports (Driving Side)
//!
//! Seams between the protocol manager and the services it hosts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use shared_types::CatchupBundle;

use crate::domain::{CommError, Msg, Peer, SelfRole};

/// Peer lookup shared by broadcasters, downloader and verifier discovery.
pub trait PeerManager: Send + Sync {
    /// Every connected peer across all sets.
    fn get_peers(&self) -> HashMap<String, Arc<Peer>>;

    fn best_peer(&self) -> Option<Arc<Peer>>;

    fn get_peer(&self, id: &str) -> Option<Arc<Peer>>;

    /// Remove from every set and hard-disconnect.
    fn remove_peer(&self, id: &str);

    /// Whether the local node is more than a few blocks behind its best peer.
    fn is_sync(&self) -> bool;
}

/// Verifier-aware view used by verifier discovery.
pub trait AbsPeerManager: PeerManager {
    fn self_role(&self) -> SelfRole;

    fn self_is_current_verifier(&self) -> bool;

    fn self_is_next_verifier(&self) -> bool;

    /// `(missing_current, missing_next)` against the expected committee size.
    /// With `with_organize`, the sets are re-partitioned first when short.
    fn have_enough_verifiers(&self, with_organize: bool) -> (usize, usize);

    fn current_verifier_peers(&self) -> Vec<Arc<Peer>>;

    fn next_verifier_peers(&self) -> Vec<Arc<Peer>>;

    fn verifier_boot_peers(&self) -> Vec<Arc<Peer>>;
}

/// A message-handling service hosted by the protocol manager.
///
/// Each code returned by `msg_codes` is routed to `handle_msg`.
#[async_trait]
pub trait CommunicationService: Send + Sync {
    fn msg_codes(&self) -> Vec<u64>;

    async fn handle_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError>;
}

/// A service with a background lifecycle.
pub trait CommunicationExecutable: Send + Sync {
    fn start(&self) -> Result<(), CommError>;

    fn stop(&self);
}

/// Notified after a peer has been admitted.
pub trait PeerObserver: Send + Sync {
    fn on_new_peer(&self, peer: Arc<Peer>);
}

/// Body request issued by the block fetcher for an announced hash.
#[async_trait]
pub trait FetchRequest: Send + Sync {
    async fn request(&self) -> Result<(), CommError>;
}

/// Notified after the block fetcher commits a bundle.
pub trait BlockImportObserver: Send + Sync {
    fn on_block_imported(&self, bundle: CatchupBundle);
}
