//! # Core Domain Entities
//!
//! Chain primitives as seen by the chain-communication layer.
//!
//! ## Clusters
//!
//! - **Identity**: [`Hash`], [`Address`], [`NodeType`]
//! - **Chain**: [`BlockHeader`], [`Block`], [`Transaction`]
//! - **Consensus**: [`Verification`], [`CatchupBundle`]

use serde::{Deserialize, Serialize};

use crate::codec::keccak256;
use crate::errors::TypeError;

// Re-export U256 from primitive-types for use across all crates
pub use primitive_types::U256;

// =============================================================================
// CLUSTER A: IDENTITY
// =============================================================================

/// A 32-byte Keccak-256 hash.
pub type Hash = [u8; 32];

/// A 20-byte account / verifier address.
pub type Address = [u8; 20];

/// The all-zero hash.
pub const ZERO_HASH: Hash = [0u8; 32];

/// The all-zero address. Peers that cannot prove a verifier identity carry it.
pub const ZERO_ADDRESS: Address = [0u8; 20];

/// Hex rendering with `0x` prefix, used for logs and peer snapshots.
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a `0x`-prefixed (or bare) hex string into a fixed-width value.
pub fn from_hex<const N: usize>(s: &str) -> Result<[u8; N], TypeError> {
    let raw = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(raw).map_err(|_| TypeError::InvalidHex(s.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| TypeError::InvalidHex(s.to_string()))
}

/// Role a node declares for itself on the network.
///
/// The numeric values are part of the handshake wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Full node without consensus duties.
    #[default]
    Normal,
    /// Coordinates a pool of miners.
    MineMaster,
    /// Participates in BFT consensus.
    Verifier,
    /// Well-known node that bootstraps the verifier peer graph.
    VerifierBoot,
    /// Connects to a mine master only.
    Miner,
}

impl NodeType {
    /// Wire value of this node type.
    pub fn as_u64(self) -> u64 {
        match self {
            NodeType::Normal => 0,
            NodeType::MineMaster => 1,
            NodeType::Verifier => 2,
            NodeType::VerifierBoot => 3,
            NodeType::Miner => 4,
        }
    }
}

impl TryFrom<u64> for NodeType {
    type Error = TypeError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(NodeType::Normal),
            1 => Ok(NodeType::MineMaster),
            2 => Ok(NodeType::Verifier),
            3 => Ok(NodeType::VerifierBoot),
            4 => Ok(NodeType::Miner),
            other => Err(TypeError::UnknownNodeType(other)),
        }
    }
}

// =============================================================================
// CLUSTER B: THE CHAIN
// =============================================================================

/// Block header. The block hash is Keccak-256 over its RLP encoding.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Header format version.
    pub version: u64,
    /// Height in the chain (0 = genesis).
    pub number: u64,
    /// Hash of the parent block.
    pub parent_hash: Hash,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Address of the proposer.
    pub proposer: Address,
    /// Root over the transaction hashes.
    pub tx_root: Hash,
}

impl BlockHeader {
    /// Header at `number` on top of `parent_hash` with zeroed metadata.
    pub fn new(number: u64, parent_hash: Hash) -> Self {
        Self {
            number,
            parent_hash,
            ..Default::default()
        }
    }

    /// Keccak-256 over the RLP encoding.
    pub fn hash(&self) -> Hash {
        keccak256(&rlp::encode(self))
    }
}

/// A block as transported between peers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Transactions in execution order.
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }

    pub fn parent_hash(&self) -> Hash {
        self.header.parent_hash
    }

    pub fn tx_count(&self) -> usize {
        self.transactions.len()
    }
}

/// A signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender nonce.
    pub nonce: u64,
    /// Sender address.
    pub from: Address,
    /// Recipient address.
    pub to: Address,
    /// Transferred amount.
    pub value: U256,
    /// Fee offered.
    pub fee: U256,
    /// Call data.
    pub data: Vec<u8>,
    /// Sender signature.
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Keccak-256 over the RLP encoding.
    pub fn hash(&self) -> Hash {
        keccak256(&rlp::encode(self))
    }

    /// Encoded size in bytes, used to pace bulk transfers.
    pub fn size(&self) -> usize {
        rlp::encode(self).len()
    }
}

// =============================================================================
// CLUSTER C: CONSENSUS
// =============================================================================

/// A single verifier's commit vote for a block.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Verification {
    /// Height voted on.
    pub height: u64,
    /// BFT round of the vote.
    pub round: u64,
    /// Hash of the block voted for.
    pub block_hash: Hash,
    /// Address of the voting verifier.
    pub signer: Address,
    /// Vote signature.
    pub signature: Vec<u8>,
}

/// A block packaged with the seen commits that caused it to be committed.
///
/// The chain store refuses to persist a block without its commits, so fetch
/// and catch-up paths always move blocks in this form.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatchupBundle {
    pub block: Block,
    pub seen_commits: Vec<Verification>,
}

impl CatchupBundle {
    pub fn new(block: Block, seen_commits: Vec<Verification>) -> Self {
        Self {
            block,
            seen_commits,
        }
    }

    pub fn hash(&self) -> Hash {
        self.block.hash()
    }

    pub fn number(&self) -> u64 {
        self.block.number()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_wire_values() {
        for nt in [
            NodeType::Normal,
            NodeType::MineMaster,
            NodeType::Verifier,
            NodeType::VerifierBoot,
            NodeType::Miner,
        ] {
            assert_eq!(NodeType::try_from(nt.as_u64()), Ok(nt));
        }
        assert_eq!(
            NodeType::try_from(9),
            Err(TypeError::UnknownNodeType(9))
        );
    }

    #[test]
    fn test_block_hash_depends_on_header() {
        let a = Block::new(BlockHeader::new(1, ZERO_HASH), vec![]);
        let b = Block::new(BlockHeader::new(2, ZERO_HASH), vec![]);
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.clone().hash());
    }

    #[test]
    fn test_hex_helpers() {
        let addr: Address = [0xAB; 20];
        let s = to_hex(&addr);
        assert!(s.starts_with("0xabab"));
        assert_eq!(from_hex::<20>(&s), Ok(addr));
        assert!(from_hex::<32>(&s).is_err());
    }
}
