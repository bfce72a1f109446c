//! # Peer
//!
//! Handle on one remote counterparty: its connection plus the state it
//! declared during the handshake (head, node type, name, contact URL,
//! verifier address).

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rlp::Encodable;
use serde::Serialize;
use shared_types::{to_hex, Address, Hash, NodeType, ZERO_ADDRESS, ZERO_HASH};

use super::errors::TransportError;
use super::messages::Msg;
use crate::ports::outbound::PeerConnection;

/// Why a connection was closed by this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested,
    TooManyPeers,
    ProtocolError,
    /// Dropped from the base set after a verifier rotation.
    BaseOverflow,
    AlreadyConnected,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::BaseOverflow => "base set overflow",
            DisconnectReason::AlreadyConnected => "already connected",
        };
        f.write_str(s)
    }
}

/// Reported chain head of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHead {
    pub hash: Hash,
    pub height: u64,
}

impl Default for PeerHead {
    fn default() -> Self {
        Self {
            hash: ZERO_HASH,
            height: 0,
        }
    }
}

/// Point-in-time view of a peer, for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsPeerInfo {
    pub id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub raw_url: String,
    pub head_hash: String,
    pub head_height: u64,
    pub verifier_address: String,
}

#[derive(Debug, Default)]
struct PeerState {
    head: PeerHead,
    node_type: NodeType,
    node_name: String,
    raw_url: String,
    verifier_address: Address,
}

/// A connected remote peer.
pub struct Peer {
    id: String,
    version: u32,
    conn: Arc<dyn PeerConnection>,
    state: RwLock<PeerState>,
    running: AtomicBool,
}

impl Peer {
    pub fn new(id: impl Into<String>, version: u32, conn: Arc<dyn PeerConnection>) -> Self {
        Self {
            id: id.into(),
            version,
            conn,
            state: RwLock::new(PeerState::default()),
            running: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    // -------------------------------------------------------------------------
    // Messaging
    // -------------------------------------------------------------------------

    pub async fn read_msg(&self) -> Result<Msg, TransportError> {
        self.conn.read_msg().await
    }

    pub async fn send_msg(&self, msg: Msg) -> Result<(), TransportError> {
        self.conn.write_msg(msg).await
    }

    /// Encode `value` and send it under `code`.
    pub async fn send<T: Encodable>(&self, code: u64, value: &T) -> Result<(), TransportError> {
        self.send_msg(Msg::new(code, rlp::encode(value).to_vec())).await
    }

    /// Hard-close the connection and mark the peer not running.
    pub fn disconnect(&self, reason: DisconnectReason) {
        self.set_not_running();
        self.conn.disconnect(reason);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_not_running(&self) {
        self.running.store(false, Ordering::Release);
    }

    // -------------------------------------------------------------------------
    // Declared state
    // -------------------------------------------------------------------------

    pub fn head(&self) -> PeerHead {
        self.state.read().head
    }

    pub fn set_head(&self, hash: Hash, height: u64) {
        self.state.write().head = PeerHead { hash, height };
    }

    pub fn node_type(&self) -> NodeType {
        self.state.read().node_type
    }

    pub fn set_node_type(&self, node_type: NodeType) {
        self.state.write().node_type = node_type;
    }

    pub fn node_name(&self) -> String {
        self.state.read().node_name.clone()
    }

    pub fn set_node_name(&self, name: impl Into<String>) {
        self.state.write().node_name = name.into();
    }

    pub fn raw_url(&self) -> String {
        self.state.read().raw_url.clone()
    }

    pub fn set_raw_url(&self, url: impl Into<String>) {
        self.state.write().raw_url = url.into();
    }

    /// Verifier address proven by the handshake signature, zero otherwise.
    pub fn verifier_address(&self) -> Address {
        self.state.read().verifier_address
    }

    pub fn set_verifier_address(&self, address: Address) {
        self.state.write().verifier_address = address;
    }

    pub fn has_verifier_address(&self) -> bool {
        self.verifier_address() != ZERO_ADDRESS
    }

    pub fn info(&self) -> CsPeerInfo {
        let state = self.state.read();
        CsPeerInfo {
            id: self.id.clone(),
            node_name: state.node_name.clone(),
            node_type: state.node_type,
            raw_url: state.raw_url.clone(),
            head_hash: to_hex(&state.head.hash),
            head_height: state.head.height,
            verifier_address: to_hex(&state.verifier_address),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("node_type", &state.node_type)
            .field("node_name", &state.node_name)
            .field("head_height", &state.head.height)
            .field("running", &self.is_running())
            .finish()
    }
}
