//! # Seen-Commits Cache
//!
//! Commit lists keyed by `"seen_commits" || height (u64 BE) || block hash`,
//! stored as an RLP list of verifications.
//!
//! The genesis block and block 1 are committed without a quorum, so a
//! missing entry at height ≤ 1 reads as an empty list. Anywhere else a
//! missing or empty entry is [`CacheDbError::Empty`].

use std::sync::Arc;

use rlp::Rlp;
use shared_types::{Hash, Verification};
use tracing::debug;

use crate::domain::CacheDbError;
use crate::ports::KeyValueStore;

const SEEN_COMMITS_PREFIX: &[u8] = b"seen_commits";

pub fn seen_commits_key(height: u64, hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(SEEN_COMMITS_PREFIX.len() + 8 + 32);
    key.extend_from_slice(SEEN_COMMITS_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key.extend_from_slice(hash);
    key
}

pub struct CacheDb {
    store: Arc<dyn KeyValueStore>,
}

impl CacheDb {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn save_seen_commits(
        &self,
        height: u64,
        hash: &Hash,
        commits: &[Verification],
    ) -> Result<(), CacheDbError> {
        let value = rlp::encode_list::<Verification, Verification>(commits);
        self.store.put(&seen_commits_key(height, hash), &value)?;
        debug!(height, commits = commits.len(), "saved seen commits");
        Ok(())
    }

    pub fn get_seen_commits(
        &self,
        height: u64,
        hash: &Hash,
    ) -> Result<Vec<Verification>, CacheDbError> {
        let value = self
            .store
            .get(&seen_commits_key(height, hash))?
            .unwrap_or_default();
        let commits = if value.is_empty() {
            Vec::new()
        } else {
            decode_commits(&value)?
        };
        if commits.is_empty() && height > 1 {
            return Err(CacheDbError::Empty { height });
        }
        Ok(commits)
    }

    pub fn delete_seen_commits(&self, height: u64, hash: &Hash) -> Result<(), CacheDbError> {
        self.store.delete(&seen_commits_key(height, hash))?;
        Ok(())
    }
}

/// The stored value must be exactly one RLP list.
fn decode_commits(value: &[u8]) -> Result<Vec<Verification>, CacheDbError> {
    let rlp = Rlp::new(value);
    if !rlp.is_list() {
        return Err(CacheDbError::Decode("seen commits are not a list".into()));
    }
    let info = rlp
        .payload_info()
        .map_err(|e| CacheDbError::Decode(e.to_string()))?;
    if info.header_len + info.value_len != value.len() {
        return Err(CacheDbError::Decode(format!(
            "{} trailing bytes after seen commits",
            value.len().saturating_sub(info.header_len + info.value_len)
        )));
    }
    rlp.as_list()
        .map_err(|e| CacheDbError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryKvStore;
    use crate::domain::KvStoreError;

    fn commit(height: u64) -> Verification {
        Verification {
            height,
            round: 0,
            block_hash: [height as u8; 32],
            signer: [9u8; 20],
            signature: vec![1, 2, 3],
        }
    }

    fn db() -> (CacheDb, Arc<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new());
        (CacheDb::new(store.clone()), store)
    }

    #[test]
    fn test_key_layout() {
        let key = seen_commits_key(0x0102, &[0xff; 32]);
        assert_eq!(&key[..12], b"seen_commits");
        assert_eq!(&key[12..20], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&key[20..], &[0xff; 32]);
    }

    #[test]
    fn test_save_then_get() {
        let (db, _) = db();
        db.save_seen_commits(7, &[7u8; 32], &[commit(7), commit(7)])
            .unwrap();
        assert_eq!(db.get_seen_commits(7, &[7u8; 32]).unwrap().len(), 2);
        assert!(matches!(
            db.get_seen_commits(7, &[8u8; 32]),
            Err(CacheDbError::Empty { height: 7 })
        ));
    }

    #[test]
    fn test_low_heights_read_empty() {
        let (db, _) = db();
        assert!(db.get_seen_commits(0, &[0u8; 32]).unwrap().is_empty());
        assert!(db.get_seen_commits(1, &[1u8; 32]).unwrap().is_empty());

        db.save_seen_commits(1, &[1u8; 32], &[commit(1)]).unwrap();
        assert_eq!(db.get_seen_commits(1, &[1u8; 32]).unwrap(), vec![commit(1)]);
    }

    #[test]
    fn test_corrupt_value() {
        let (db, store) = db();
        store
            .put(&seen_commits_key(4, &[4u8; 32]), &[1, 2, 3])
            .unwrap();
        assert!(matches!(
            db.get_seen_commits(4, &[4u8; 32]),
            Err(CacheDbError::Decode(_))
        ));
    }

    #[test]
    fn test_stored_empty_list() {
        let (db, store) = db();
        let empty = rlp::encode_list::<Verification, Verification>(&[]);
        store.put(&seen_commits_key(4, &[4u8; 32]), &empty).unwrap();
        store.put(&seen_commits_key(1, &[1u8; 32]), &empty).unwrap();

        assert!(matches!(
            db.get_seen_commits(4, &[4u8; 32]),
            Err(CacheDbError::Empty { height: 4 })
        ));
        assert!(db.get_seen_commits(1, &[1u8; 32]).unwrap().is_empty());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let (db, store) = db();
        let mut value = rlp::encode_list::<Verification, Verification>(&[commit(5)]).to_vec();
        value.extend_from_slice(&[0xc0, 0x01]);
        store.put(&seen_commits_key(5, &[5u8; 32]), &value).unwrap();

        assert!(matches!(
            db.get_seen_commits(5, &[5u8; 32]),
            Err(CacheDbError::Decode(_))
        ));
    }

    #[test]
    fn test_single_byte_value_rejected_at_any_height() {
        let (db, store) = db();
        store.put(&seen_commits_key(1, &[1u8; 32]), &[0x05]).unwrap();
        assert!(matches!(
            db.get_seen_commits(1, &[1u8; 32]),
            Err(CacheDbError::Decode(_))
        ));
    }

    #[test]
    fn test_delete() {
        let (db, store) = db();
        db.save_seen_commits(3, &[3u8; 32], &[commit(3)]).unwrap();
        db.delete_seen_commits(3, &[3u8; 32]).unwrap();
        assert!(store.is_empty());
    }

    struct FailingStore;

    impl KeyValueStore for FailingStore {
        fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>, KvStoreError> {
            Err(KvStoreError::IoError {
                message: "disk gone".into(),
            })
        }

        fn put(&self, _key: &[u8], _value: &[u8]) -> Result<(), KvStoreError> {
            Err(KvStoreError::IoError {
                message: "disk gone".into(),
            })
        }

        fn delete(&self, _key: &[u8]) -> Result<(), KvStoreError> {
            Ok(())
        }
    }

    #[test]
    fn test_store_errors_propagate() {
        let db = CacheDb::new(Arc::new(FailingStore));
        assert!(matches!(
            db.get_seen_commits(3, &[0u8; 32]),
            Err(CacheDbError::Store(KvStoreError::IoError { .. }))
        ));
        assert!(db.save_seen_commits(3, &[0u8; 32], &[]).is_err());
    }
}
