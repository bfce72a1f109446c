//! # RLP Wire Encodings
//!
//! Every entity is encoded as an RLP list of its fields in declaration order.
//! Fixed-width byte arrays are encoded as byte strings and must decode back to
//! exactly the same width.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use sha3::{Digest, Keccak256};

use crate::entities::{Block, BlockHeader, CatchupBundle, Hash, Transaction, Verification};

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Decode list item `index` as a byte string of exactly `N` bytes.
pub fn decode_fixed<const N: usize>(rlp: &Rlp, index: usize) -> Result<[u8; N], DecoderError> {
    let bytes: Vec<u8> = rlp.val_at(index)?;
    if bytes.len() != N {
        return Err(DecoderError::Custom("fixed-width field has wrong length"));
    }
    let mut arr = [0u8; N];
    arr.copy_from_slice(&bytes);
    Ok(arr)
}

fn expect_list(rlp: &Rlp, items: usize) -> Result<(), DecoderError> {
    if !rlp.is_list() {
        return Err(DecoderError::RlpExpectedToBeList);
    }
    if rlp.item_count()? != items {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    Ok(())
}

impl Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.version);
        s.append(&self.number);
        s.append(&self.parent_hash.to_vec());
        s.append(&self.timestamp);
        s.append(&self.proposer.to_vec());
        s.append(&self.tx_root.to_vec());
    }
}

impl Decodable for BlockHeader {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 6)?;
        Ok(Self {
            version: rlp.val_at(0)?,
            number: rlp.val_at(1)?,
            parent_hash: decode_fixed(rlp, 2)?,
            timestamp: rlp.val_at(3)?,
            proposer: decode_fixed(rlp, 4)?,
            tx_root: decode_fixed(rlp, 5)?,
        })
    }
}

impl Encodable for Transaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(7);
        s.append(&self.nonce);
        s.append(&self.from.to_vec());
        s.append(&self.to.to_vec());
        s.append(&self.value);
        s.append(&self.fee);
        s.append(&self.data);
        s.append(&self.signature);
    }
}

impl Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 7)?;
        Ok(Self {
            nonce: rlp.val_at(0)?,
            from: decode_fixed(rlp, 1)?,
            to: decode_fixed(rlp, 2)?,
            value: rlp.val_at(3)?,
            fee: rlp.val_at(4)?,
            data: rlp.val_at(5)?,
            signature: rlp.val_at(6)?,
        })
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.append_list::<Transaction, _>(&self.transactions);
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 2)?;
        Ok(Self {
            header: rlp.val_at(0)?,
            transactions: rlp.list_at(1)?,
        })
    }
}

impl Encodable for Verification {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.height);
        s.append(&self.round);
        s.append(&self.block_hash.to_vec());
        s.append(&self.signer.to_vec());
        s.append(&self.signature);
    }
}

impl Decodable for Verification {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 5)?;
        Ok(Self {
            height: rlp.val_at(0)?,
            round: rlp.val_at(1)?,
            block_hash: decode_fixed(rlp, 2)?,
            signer: decode_fixed(rlp, 3)?,
            signature: rlp.val_at(4)?,
        })
    }
}

impl Encodable for CatchupBundle {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.block);
        s.append_list::<Verification, _>(&self.seen_commits);
    }
}

impl Decodable for CatchupBundle {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 2)?;
        Ok(Self {
            block: rlp.val_at(0)?,
            seen_commits: rlp.list_at(1)?,
        })
    }
}
