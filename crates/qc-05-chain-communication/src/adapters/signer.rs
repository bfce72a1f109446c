//! secp256k1 node key signing handshake statuses.

use k256::ecdsa::SigningKey;
use shared_types::{Address, Hash};

use crate::domain::{address_from_pubkey, CommError};
use crate::ports::NodeSigner;

/// Node key held in memory.
pub struct LocalSigner {
    signing_key: SigningKey,
    address: Address,
}

impl LocalSigner {
    /// Generate a random key.
    pub fn generate() -> Self {
        Self::from_key(SigningKey::random(&mut rand::thread_rng()))
    }

    /// Load a 32-byte secret key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommError> {
        let signing_key = SigningKey::from_slice(bytes)
            .map_err(|e| CommError::Signature(format!("invalid node key: {e}")))?;
        Ok(Self::from_key(signing_key))
    }

    fn from_key(signing_key: SigningKey) -> Self {
        let address = address_from_pubkey(signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }
}

impl NodeSigner for LocalSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn public_key(&self) -> Vec<u8> {
        self.signing_key.verifying_key().to_sec1_bytes().to_vec()
    }

    fn sign_hash(&self, hash: &Hash) -> Result<Vec<u8>, CommError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(hash)
            .map_err(|e| CommError::Signature(e.to_string()))?;
        let mut out = signature.to_bytes().to_vec();
        out.push(recovery_id.to_byte());
        Ok(out)
    }
}
