//! # Error Types
//!
//! Errors raised by the chain-communication core and by the ports it drives.
//!
//! ## Classification
//!
//! - **Broken**: the connection is unusable; the read loop marks the peer
//!   not-running and the peer is removed from every set
//!   ([`CommError::is_broken`]).
//! - **Transient**: logged, the read loop pauses briefly and continues.
//! - **Find preconditions**: recovered locally by the caller without side
//!   effects ([`CommError::is_find_precondition`]).

use rlp::DecoderError;
use shared_types::{NodeType, TypeError};
use thiserror::Error;

/// Errors produced by a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection was closed by either side.
    #[error("connection closed")]
    Closed,

    /// The remote end is shutting down.
    #[error("peer is shutting down")]
    ShuttingDown,

    /// A read or write did not complete in time.
    #[error("transport timeout")]
    Timeout,

    /// Low-level I/O failure.
    #[error("transport io error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether the connection can no longer be used.
    pub fn is_broken(&self) -> bool {
        matches!(
            self,
            TransportError::Closed | TransportError::ShuttingDown | TransportError::Io(_)
        )
    }
}

/// Errors returned by the chain store when persisting a block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The block is at the current height and is not a special block.
    #[error("block height {height} is current and not special")]
    HeightIsCurrentAndNotSpecial { height: u64 },

    /// The parent of the block is unknown.
    #[error("parent block not found for height {height}")]
    ParentNotFound { height: u64 },

    /// Any other rejection by the store.
    #[error("chain store rejected block: {0}")]
    Rejected(String),
}

/// Errors of the key-value store backing the cache database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KvStoreError {
    /// I/O error during read/write.
    #[error("kv store i/o error: {message}")]
    IoError { message: String },

    /// Data corruption in the store.
    #[error("kv store corruption: {message}")]
    Corruption { message: String },
}

/// A transaction refused by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tx rejected by pool: {0}")]
pub struct TxRejected(pub String);

/// Errors of the seen-commits cache database.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheDbError {
    /// No commits stored for a height above 1.
    #[error("no seen commits stored for height {height}")]
    Empty { height: u64 },

    /// Stored value is not a valid commit list.
    #[error("seen commits decode error: {0}")]
    Decode(String),

    /// Underlying key-value store failure.
    #[error(transparent)]
    Store(#[from] KvStoreError),
}

/// Errors of the chain-communication core.
#[derive(Debug, Error)]
pub enum CommError {
    // -------------------------------------------------------------------------
    // Protocol errors (fail the connection)
    // -------------------------------------------------------------------------
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    #[error("no handler registered for message code {0:#x}")]
    HandlerNotFound(u64),

    #[error("network id not match, remote: {remote} local: {local}")]
    NetworkIdMismatch { remote: u64, local: u64 },

    #[error("genesis block not match")]
    GenesisMismatch,

    #[error("cs protocol version not match, remote: {remote} local: {local}")]
    ProtocolVersionMismatch { remote: u32, local: u32 },

    #[error("empty handshake from remote")]
    EmptyHandshake,

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("first message must be a status message, got code {0:#x}")]
    NoStatusMsg(u64),

    // -------------------------------------------------------------------------
    // Capacity and admission
    // -------------------------------------------------------------------------
    #[error("too many peers")]
    TooManyPeers,

    #[error("peer is already registered: {0}")]
    AlreadyPresent(String),

    #[error("peer is not registered: {0}")]
    NotPresent(String),

    #[error("peer set is closed")]
    PeerSetClosed,

    #[error("peer not valid, empty peer id")]
    EmptyPeerId,

    #[error("remote peer node type illegal: {0:?}")]
    IllegalNodeType(NodeType),

    #[error("current verifier address already in peer set")]
    DuplicateCurrentVerifierAddress,

    #[error("next verifier address already in peer set")]
    DuplicateNextVerifierAddress,

    #[error("no found peer: {0}")]
    PeerNotFound(String),

    #[error("no verifier peer for fetcher")]
    NoVerifierPeerForFetcher,

    #[error("message handler already registered for code {0:#x}")]
    DuplicateHandler(u64),

    // -------------------------------------------------------------------------
    // Find preconditions (recovered locally)
    // -------------------------------------------------------------------------
    #[error("no best peer found")]
    NoBestPeerFound,

    #[error("current height too low, local: {local} remote: {remote}")]
    CurrentHeightTooLow { local: u64, remote: u64 },

    #[error("current block is change point, do not find verifiers")]
    IsChangePoint,

    #[error("self is not current or next verifier")]
    NotCurrentOrNextVerifier,

    #[error("already started")]
    AlreadyStarted,

    #[error("verifier not in verifier cache")]
    NotInVerifierCache,

    #[error("can't get slot for block {0}")]
    SlotUnavailable(u64),

    // -------------------------------------------------------------------------
    // Wrapped collaborator errors
    // -------------------------------------------------------------------------
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    CacheDb(#[from] CacheDbError),

    #[error("decode error: {0}")]
    Decode(#[from] DecoderError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("invalid node url: {0}")]
    InvalidNodeUrl(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("service stopped")]
    Stopped,
}

impl CommError {
    /// Whether the error invalidates the connection it occurred on.
    pub fn is_broken(&self) -> bool {
        match self {
            CommError::Transport(e) => e.is_broken(),
            CommError::MessageTooLarge { .. }
            | CommError::HandlerNotFound(_)
            | CommError::NetworkIdMismatch { .. }
            | CommError::GenesisMismatch
            | CommError::ProtocolVersionMismatch { .. }
            | CommError::EmptyHandshake
            | CommError::HandshakeTimeout
            | CommError::NoStatusMsg(_)
            | CommError::Stopped => true,
            _ => false,
        }
    }

    /// Whether the error is a verifier-finder precondition failure.
    pub fn is_find_precondition(&self) -> bool {
        matches!(
            self,
            CommError::NoBestPeerFound
                | CommError::CurrentHeightTooLow { .. }
                | CommError::IsChangePoint
                | CommError::NotCurrentOrNextVerifier
                | CommError::AlreadyStarted
                | CommError::NotInVerifierCache
        )
    }
}
