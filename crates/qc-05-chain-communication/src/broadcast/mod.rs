//! # Broadcasters
//!
//! Push dissemination of mined blocks, verified blocks and transactions.
//!
//! | Broadcaster | Code | Known cache | Queue |
//! |-------------|------|-------------|-------|
//! | [`BlockBroadcaster`] | `NewBlockV1Msg` | 500 | 4 |
//! | [`VerifiedBlockBroadcaster`] | `VerifyBlockResultMsg` / `VerifyBlockHashResultMsg` | 500 | 4 |
//! | [`TxBroadcaster`] | `TxV1Msg` | 32768 | 128 |
//!
//! Every broadcaster owns a [`TransportRegistry`]; delivery errors stay in
//! the transport task and never reach the caller.

pub mod block;
pub mod transport;
pub mod tx;
pub mod verified;

use std::sync::Arc;

use rand::seq::SliceRandom;
use shared_types::NodeType;

use crate::domain::Peer;

pub use block::BlockBroadcaster;
pub use transport::{Outbound, PeerTransport, TransportRegistry, TRANSPORT_IDLE_TIMEOUT};
pub use tx::TxBroadcaster;
pub use verified::VerifiedBlockBroadcaster;

/// Lower bound on the non-verifier peers a block is pushed to.
pub const MIN_BROADCAST_PEERS: usize = 4;

/// Per-peer known-block cache size.
pub const MAX_KNOWN_BLOCKS: usize = 500;

/// Per-peer block queue depth.
pub const MAX_QUEUED_BLOCKS: usize = 4;

/// `max(sqrt(n), MIN_BROADCAST_PEERS)`, capped at `n`.
pub fn transfer_len(n: usize) -> usize {
    ((n as f64).sqrt() as usize).max(MIN_BROADCAST_PEERS).min(n)
}

/// Split `peers` into verifiers and a random subset of the rest.
pub fn fan_out(peers: Vec<Arc<Peer>>) -> (Vec<Arc<Peer>>, Vec<Arc<Peer>>) {
    let (verifiers, mut others): (Vec<_>, Vec<_>) = peers
        .into_iter()
        .partition(|p| p.node_type() == NodeType::Verifier);
    others.shuffle(&mut rand::thread_rng());
    others.truncate(transfer_len(others.len()));
    (verifiers, others)
}
