//! # Outbound Ports (Driven Side)
//!
//! Collaborators the chain-communication core depends on. Adapters for the
//! transport, chain store, consensus engine and tx pool live outside this
//! crate; test doubles live in `test_utils`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use shared_types::{Address, Block, Hash, Transaction, Verification};
use tokio::sync::broadcast;

use crate::domain::{
    ChainError, CommError, DisconnectReason, KvStoreError, Msg, NodeUrl, Peer, TransportError,
    TxRejected,
};

// =============================================================================
// TRANSPORT
// =============================================================================

/// A framed message stream to one remote endpoint.
///
/// `read_msg` and `write_msg` may be called concurrently from different tasks.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Observed socket address of the remote end.
    fn remote_addr(&self) -> SocketAddr;

    /// Block until the next message arrives.
    async fn read_msg(&self) -> Result<Msg, TransportError>;

    /// Write one message.
    async fn write_msg(&self, msg: Msg) -> Result<(), TransportError>;

    /// Hard-close the connection. Idempotent.
    fn disconnect(&self, reason: DisconnectReason);
}

/// Node-level p2p server that dials and drops connections.
pub trait P2PServer: Send + Sync {
    /// Contact URL of the local node.
    fn self_node(&self) -> NodeUrl;

    /// Dial `node` (no-op when already connected).
    fn add_peer(&self, node: NodeUrl);

    /// Drop the static connection to `node`.
    fn remove_peer(&self, node: &NodeUrl);
}

// =============================================================================
// CHAIN STORE
// =============================================================================

/// Chain store as seen by the communication layer.
///
/// Implementations serialize concurrent `save_block` calls internally.
pub trait ChainReader: Send + Sync {
    fn current_block(&self) -> Block;

    fn get_block_by_hash(&self, hash: &Hash) -> Option<Block>;

    fn get_block_by_number(&self, number: u64) -> Option<Block>;

    /// Seen commits that finalized the block at `height`.
    fn get_seen_commits(&self, height: u64) -> Option<Vec<Verification>>;

    /// Consensus slot of `block`.
    fn get_slot(&self, block: &Block) -> Option<u64>;

    /// Whether `block` closes a slot and rotates verifier membership.
    fn is_change_point(&self, block: &Block) -> bool;

    /// Persist a block together with its seen commits.
    fn save_block(&self, block: &Block, seen_commits: &[Verification]) -> Result<(), ChainError>;

    /// Stream of committed blocks, in insertion order.
    fn subscribe_inserted_blocks(&self) -> broadcast::Receiver<Block>;
}

/// Current and next verifier address lists.
pub trait VerifiersReader: Send + Sync {
    fn current_verifiers(&self) -> Vec<Address>;

    fn next_verifiers(&self) -> Vec<Address>;

    /// True between a change point and the moment the store swaps the lists.
    fn should_change_current(&self) -> bool;
}

// =============================================================================
// CONSENSUS AND POOLS
// =============================================================================

/// BFT consensus engine.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// A freshly mined block that verifiers must vote on.
    fn on_new_wait_verify_block(&self, block: Block, peer_id: &str);

    /// Consensus-range message received from a verifier peer.
    async fn on_new_p2p_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError>;

    /// Switch the primary after a verifier rotation.
    fn change_primary(&self, primary: Address);

    /// Start voting on `height`.
    fn on_enter_new_height(&self, height: u64);
}

/// Transaction pool.
pub trait TxPool: Send + Sync {
    /// Admit remote transactions. One result per input, in order.
    fn add_remotes(&self, txs: Vec<Transaction>) -> Vec<Result<(), TxRejected>>;

    /// Executable transactions grouped by sender.
    fn pending(&self) -> HashMap<Address, Vec<Transaction>>;
}

/// Miner-side handler used by the mine protocol manager.
#[async_trait]
pub trait MineMsgHandler: Send + Sync {
    fn set_mine_master_peer(&self, peer: Arc<Peer>);

    async fn on_new_msg(&self, msg: Msg, peer: Arc<Peer>) -> Result<(), CommError>;
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Signing key of the local node.
pub trait NodeSigner: Send + Sync {
    /// Address derived from the public key.
    fn address(&self) -> Address;

    /// SEC1-compressed public key.
    fn public_key(&self) -> Vec<u8>;

    /// 65-byte recoverable signature `r || s || v` over a prehashed message.
    fn sign_hash(&self, hash: &Hash) -> Result<Vec<u8>, CommError>;
}

// =============================================================================
// STORAGE
// =============================================================================

/// Byte-oriented key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvStoreError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvStoreError>;

    fn delete(&self, key: &[u8]) -> Result<(), KvStoreError>;

    fn exists(&self, key: &[u8]) -> Result<bool, KvStoreError> {
        Ok(self.get(key)?.is_some())
    }
}
