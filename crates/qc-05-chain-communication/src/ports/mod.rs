//! # Ports
//!
//! - [`inbound`]: what the protocol manager offers its services.
//! - [`outbound`]: what the core needs from the rest of the node.

pub mod inbound;
pub mod outbound;

pub use inbound::*;
pub use outbound::*;
