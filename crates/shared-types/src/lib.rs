//! # Shared Types Crate
//!
//! Chain primitives shared by the chain-communication core and the
//! collaborators it talks to (chain store, consensus engine, tx pool).
//!
//! ## Design Principles
//!
//! - **Plain data**: entities carry no behaviour beyond hashing and sizing.
//! - **RLP on the wire**: every entity that crosses a peer connection
//!   implements `rlp::Encodable` / `rlp::Decodable` (see [`codec`]).
//! - **Keccak identities**: block and transaction hashes are Keccak-256 over
//!   the RLP encoding.

pub mod codec;
pub mod entities;
pub mod errors;

pub use codec::{decode_fixed, keccak256};
pub use entities::*;
pub use errors::*;
