//! # Handshake Rules
//!
//! Pure checks applied to a remote `StatusData`, plus the signature scheme
//! that lets a verifier prove its address.
//!
//! ## Check Order
//!
//! 1. network id
//! 2. genesis hash
//! 3. protocol version is non-zero (`EmptyHandshake`)
//! 4. protocol version equals local
//!
//! ## Signed Status
//!
//! Nodes other than `Normal` attach their compressed public key and a
//! recoverable secp256k1 signature over `keccak256(rlp(handshake))`. The
//! receiver recovers the signer, checks it matches the attached key and
//! derives `keccak256(uncompressed_pubkey[1..])[12..]` as the verifier
//! address. Missing or invalid signatures yield the zero address.

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use shared_types::{keccak256, Address, NodeType, ZERO_ADDRESS};

use super::errors::CommError;
use super::messages::{HandShakeData, StatusData};
use crate::ports::outbound::NodeSigner;

/// Length of `r || s || v`.
pub const SIGNATURE_LEN: usize = 65;

/// Validate `remote` against the local handshake data.
pub fn verify_remote_status(local: &HandShakeData, remote: &HandShakeData) -> Result<(), CommError> {
    if remote.network_id != local.network_id {
        return Err(CommError::NetworkIdMismatch {
            remote: remote.network_id,
            local: local.network_id,
        });
    }
    if remote.genesis_block != local.genesis_block {
        return Err(CommError::GenesisMismatch);
    }
    if remote.protocol_version == 0 {
        return Err(CommError::EmptyHandshake);
    }
    if remote.protocol_version != local.protocol_version {
        return Err(CommError::ProtocolVersionMismatch {
            remote: remote.protocol_version,
            local: local.protocol_version,
        });
    }
    Ok(())
}

/// Build the outgoing status, signing it unless the node is `Normal`.
pub fn make_status(
    handshake: HandShakeData,
    node_type: NodeType,
    signer: Option<&dyn NodeSigner>,
) -> Result<StatusData, CommError> {
    let mut status = StatusData {
        handshake,
        pub_key: Vec::new(),
        sign: Vec::new(),
    };

    if node_type == NodeType::Normal {
        return Ok(status);
    }

    if let Some(signer) = signer {
        status.sign = signer.sign_hash(&status.handshake.hash())?;
        status.pub_key = signer.public_key();
    }
    Ok(status)
}

/// Verifier address proven by `status`, or the zero address.
pub fn recover_sender(status: &StatusData) -> Address {
    if status.pub_key.is_empty() || status.sign.len() != SIGNATURE_LEN {
        return ZERO_ADDRESS;
    }

    let declared = match VerifyingKey::from_sec1_bytes(&status.pub_key) {
        Ok(key) => key,
        Err(_) => return ZERO_ADDRESS,
    };

    let signature = match Signature::from_slice(&status.sign[..64]) {
        Ok(sig) => sig,
        Err(_) => return ZERO_ADDRESS,
    };

    let v = match status.sign[64] {
        0 | 27 => 0u8,
        1 | 28 => 1u8,
        _ => return ZERO_ADDRESS,
    };
    let recovery_id = match RecoveryId::try_from(v) {
        Ok(id) => id,
        Err(_) => return ZERO_ADDRESS,
    };

    let hash = status.handshake.hash();
    match VerifyingKey::recover_from_prehash(&hash, &signature, recovery_id) {
        Ok(recovered) if recovered == declared => address_from_pubkey(&recovered),
        _ => ZERO_ADDRESS,
    }
}

/// `keccak256(uncompressed[1..])[12..]`.
pub fn address_from_pubkey(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}
