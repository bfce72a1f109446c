//! # Error Types
//!
//! Errors raised while interpreting shared chain primitives.

use thiserror::Error;

/// Errors converting raw values into typed primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeError {
    /// A declared node type outside the known range.
    #[error("unknown node type: {0}")]
    UnknownNodeType(u64),

    /// A hex string that does not decode to the expected width.
    #[error("invalid hex value: {0}")]
    InvalidHex(String),
}
