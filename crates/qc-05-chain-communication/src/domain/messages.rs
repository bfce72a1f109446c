//! # Wire Messages
//!
//! Framed messages `{code, size, payload}` with RLP payloads.
//!
//! ## Code Space
//!
//! Codes below [`CONSENSUS_MSG_CODE_START`] belong to this core and are
//! dispatched to registered handlers. Codes at or above it are opaque
//! consensus-layer traffic.

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use shared_types::{decode_fixed, keccak256, Hash, U256};

// =============================================================================
// MESSAGE CODES
// =============================================================================

pub const STATUS_MSG: u64 = 0x00;
pub const TX_V1_MSG: u64 = 0x02;
pub const NEW_BLOCK_V1_MSG: u64 = 0x03;
pub const BLOCK_HASHES_MSG: u64 = 0x04;
pub const GET_BLOCKS_MSG: u64 = 0x05;
pub const BLOCKS_MSG: u64 = 0x06;
pub const VERIFY_BLOCK_RESULT_MSG: u64 = 0x07;
pub const VERIFY_BLOCK_HASH_RESULT_MSG: u64 = 0x08;
pub const GET_VERIFY_RESULT_MSG: u64 = 0x09;
pub const GET_VERIFIERS_CONN_FROM_BOOT_NODE: u64 = 0x0a;
pub const BOOT_NODE_VERIFIERS_CONN: u64 = 0x0b;

/// First code of the consensus-layer range.
pub const CONSENSUS_MSG_CODE_START: u64 = 0x100;

// =============================================================================
// LIMITS
// =============================================================================

/// Upper bound on the payload of a single message (10 MiB).
pub const PROTOCOL_MAX_MSG_SIZE: u32 = 10 * 1024 * 1024;

/// Upper bound on the bundles served for one `GetBlocksMsg`.
pub const MAX_BLOCK_FETCH: u64 = 128;

/// Human readable name of a message code, for logs.
pub fn code_name(code: u64) -> &'static str {
    match code {
        STATUS_MSG => "StatusMsg",
        TX_V1_MSG => "TxV1Msg",
        NEW_BLOCK_V1_MSG => "NewBlockV1Msg",
        BLOCK_HASHES_MSG => "BlockHashesMsg",
        GET_BLOCKS_MSG => "GetBlocksMsg",
        BLOCKS_MSG => "BlocksMsg",
        VERIFY_BLOCK_RESULT_MSG => "VerifyBlockResultMsg",
        VERIFY_BLOCK_HASH_RESULT_MSG => "VerifyBlockHashResultMsg",
        GET_VERIFY_RESULT_MSG => "GetVerifyResultMsg",
        GET_VERIFIERS_CONN_FROM_BOOT_NODE => "GetVerifiersConnFromBootNode",
        BOOT_NODE_VERIFIERS_CONN => "BootNodeVerifiersConn",
        c if c >= CONSENSUS_MSG_CODE_START => "ConsensusMsg",
        _ => "UnknownMsg",
    }
}

// =============================================================================
// FRAME
// =============================================================================

/// A framed wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub code: u64,
    pub size: u32,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new(code: u64, payload: Vec<u8>) -> Self {
        Self {
            code,
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            payload,
        }
    }

    /// Frame `value` as the RLP payload of `code`.
    pub fn encode<T: Encodable>(code: u64, value: &T) -> Self {
        Self::new(code, rlp::encode(value).to_vec())
    }

    /// Frame a sequence of items as one RLP list.
    pub fn encode_list<T: Encodable>(code: u64, items: &[T]) -> Self {
        Self::new(code, rlp::encode_list::<T, T>(items).to_vec())
    }

    pub fn decode<T: Decodable>(&self) -> Result<T, DecoderError> {
        rlp::decode(&self.payload)
    }

    pub fn decode_list<T: Decodable>(&self) -> Result<Vec<T>, DecoderError> {
        Rlp::new(&self.payload).as_list()
    }

    pub fn is_consensus(&self) -> bool {
        self.code >= CONSENSUS_MSG_CODE_START
    }
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

// =============================================================================
// HANDSHAKE
// =============================================================================

/// Unsigned portion of the handshake status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandShakeData {
    pub protocol_version: u32,
    pub chain_id: U256,
    pub network_id: u64,
    pub current_block: Hash,
    pub current_block_height: u64,
    pub genesis_block: Hash,
    pub node_type: u64,
    pub node_name: String,
    pub raw_url: String,
}

impl HandShakeData {
    /// Keccak-256 over the RLP encoding; this is what non-normal nodes sign.
    pub fn hash(&self) -> Hash {
        keccak256(&rlp::encode(self))
    }
}

impl Encodable for HandShakeData {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(9);
        s.append(&self.protocol_version);
        s.append(&self.chain_id);
        s.append(&self.network_id);
        s.append(&self.current_block.to_vec());
        s.append(&self.current_block_height);
        s.append(&self.genesis_block.to_vec());
        s.append(&self.node_type);
        s.append(&self.node_name);
        s.append(&self.raw_url);
    }
}

impl Decodable for HandShakeData {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 9)?;
        Ok(Self {
            protocol_version: rlp.val_at(0)?,
            chain_id: rlp.val_at(1)?,
            network_id: rlp.val_at(2)?,
            current_block: decode_fixed(rlp, 3)?,
            current_block_height: rlp.val_at(4)?,
            genesis_block: decode_fixed(rlp, 5)?,
            node_type: rlp.val_at(6)?,
            node_name: rlp.val_at(7)?,
            raw_url: rlp.val_at(8)?,
        })
    }
}

/// Handshake status exchanged as `StatusMsg`.
///
/// `pub_key` is a SEC1-compressed secp256k1 key and `sign` a 65-byte
/// recoverable signature over [`HandShakeData::hash`]. Both are empty for
/// normal nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatusData {
    pub handshake: HandShakeData,
    pub pub_key: Vec<u8>,
    pub sign: Vec<u8>,
}

impl Encodable for StatusData {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.handshake);
        s.append(&self.pub_key);
        s.append(&self.sign);
    }
}

impl Decodable for StatusData {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 3)?;
        Ok(Self {
            handshake: rlp.val_at(0)?,
            pub_key: rlp.val_at(1)?,
            sign: rlp.val_at(2)?,
        })
    }
}

// =============================================================================
// BLOCK ANNOUNCE AND SYNC
// =============================================================================

/// Header-only announcement `{hash, number}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHashMsg {
    pub block_hash: Hash,
    pub block_number: u64,
}

impl Encodable for BlockHashMsg {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.block_hash.to_vec());
        s.append(&self.block_number);
    }
}

impl Decodable for BlockHashMsg {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 2)?;
        Ok(Self {
            block_hash: decode_fixed(rlp, 0)?,
            block_number: rlp.val_at(1)?,
        })
    }
}

/// Range request served by the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetBlocksReq {
    pub origin_height: u64,
    pub amount: u64,
}

impl Encodable for GetBlocksReq {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.origin_height);
        s.append(&self.amount);
    }
}

impl Decodable for GetBlocksReq {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 2)?;
        Ok(Self {
            origin_height: rlp.val_at(0)?,
            amount: rlp.val_at(1)?,
        })
    }
}

// =============================================================================
// VERIFIER DISCOVERY
// =============================================================================

/// Verifier connection request sent to a verifier-boot node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVerifiersReq {
    pub id: u64,
    pub cur_miss: u64,
    pub next_miss: u64,
    pub slot: u64,
}

impl Encodable for GetVerifiersReq {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.id);
        s.append(&self.cur_miss);
        s.append(&self.next_miss);
        s.append(&self.slot);
    }
}

impl Decodable for GetVerifiersReq {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 4)?;
        Ok(Self {
            id: rlp.val_at(0)?,
            cur_miss: rlp.val_at(1)?,
            next_miss: rlp.val_at(2)?,
            slot: rlp.val_at(3)?,
        })
    }
}

/// Contact URLs of verifiers known to a boot node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GetVerifiersResp {
    pub req_id: u64,
    pub cur: Vec<String>,
    pub next: Vec<String>,
    /// Non-empty when the boot node refused the request.
    pub err_info: String,
}

impl Encodable for GetVerifiersResp {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.req_id);
        s.append_list::<String, _>(&self.cur);
        s.append_list::<String, _>(&self.next);
        s.append(&self.err_info);
    }
}

impl Decodable for GetVerifiersResp {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list(rlp, 4)?;
        Ok(Self {
            req_id: rlp.val_at(0)?,
            cur: rlp.list_at(1)?,
            next: rlp.list_at(2)?,
            err_info: rlp.val_at(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{Block, BlockHeader, CatchupBundle, ZERO_HASH};

    fn sample_status() -> StatusData {
        StatusData {
            handshake: HandShakeData {
                protocol_version: 1,
                chain_id: U256::from(1601u64),
                network_id: 1601,
                current_block: [7u8; 32],
                current_block_height: 42,
                genesis_block: [1u8; 32],
                node_type: 2,
                node_name: "verifier-1".into(),
                raw_url: "enode://abcd@127.0.0.1:30303".into(),
            },
            pub_key: vec![2u8; 33],
            sign: vec![9u8; 65],
        }
    }

    #[test]
    fn test_status_data_is_bijective() {
        let status = sample_status();
        let msg = Msg::encode(STATUS_MSG, &status);
        assert_eq!(msg.size as usize, msg.payload.len());
        let decoded: StatusData = msg.decode().unwrap();
        assert_eq!(decoded, status);
        assert_eq!(decoded.handshake.hash(), status.handshake.hash());
    }

    #[test]
    fn test_handshake_hash_covers_every_field() {
        let base = sample_status().handshake;
        let mut other = base.clone();
        other.node_name = "verifier-2".into();
        assert_ne!(base.hash(), other.hash());
    }

    #[test]
    fn test_bundle_list_payload() {
        let bundles: Vec<CatchupBundle> = (1..=3)
            .map(|n| CatchupBundle::new(Block::new(BlockHeader::new(n, ZERO_HASH), vec![]), vec![]))
            .collect();
        let msg = Msg::encode_list(BLOCKS_MSG, &bundles);
        let decoded: Vec<CatchupBundle> = msg.decode_list().unwrap();
        assert_eq!(decoded, bundles);
    }

    #[test]
    fn test_verifiers_resp_payload() {
        let resp = GetVerifiersResp {
            req_id: 99,
            cur: vec!["enode://aa@1.1.1.1:1".into(), "enode://bb@1.1.1.2:1".into()],
            next: vec![],
            err_info: String::new(),
        };
        let decoded: GetVerifiersResp = Msg::encode(BOOT_NODE_VERIFIERS_CONN, &resp)
            .decode()
            .unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn test_height_payload() {
        let msg = Msg::encode(GET_VERIFY_RESULT_MSG, &17u64);
        assert_eq!(msg.decode::<u64>().unwrap(), 17);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let mut msg = Msg::encode(
            BLOCK_HASHES_MSG,
            &BlockHashMsg {
                block_hash: [3u8; 32],
                block_number: 5,
            },
        );
        msg.payload.truncate(10);
        assert!(msg.decode::<BlockHashMsg>().is_err());
    }

    #[test]
    fn test_consensus_range() {
        assert!(Msg::new(0x100, vec![]).is_consensus());
        assert!(!Msg::new(0xff, vec![]).is_consensus());
        assert_eq!(code_name(0x250), "ConsensusMsg");
        assert_eq!(code_name(GET_BLOCKS_MSG), "GetBlocksMsg");
    }
}
