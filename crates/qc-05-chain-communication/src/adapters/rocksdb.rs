//! # RocksDB Store
//!
//! Persistent [`KeyValueStore`] for the seen-commits cache.
//!
//! Opens a single default column family with Snappy compression and a
//! bloom filter. Writes are synced when `sync_writes` is set.

use std::path::Path;

use ::rocksdb::{BlockBasedOptions, Cache, DBCompressionType, Options, WriteOptions, DB};

use crate::domain::KvStoreError;
use crate::ports::KeyValueStore;

#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    pub path: String,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    pub write_buffer_size: usize,
    pub sync_writes: bool,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            path: "./data/cache_db".to_string(),
            block_cache_size: 32 * 1024 * 1024,
            write_buffer_size: 16 * 1024 * 1024,
            sync_writes: true,
        }
    }
}

impl RocksDbConfig {
    /// Small buffers, no fsync.
    pub fn for_testing(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            write_buffer_size: 1024 * 1024,
            sync_writes: false,
        }
    }
}

pub struct RocksDbStore {
    db: DB,
    config: RocksDbConfig,
}

impl RocksDbStore {
    pub fn open(config: RocksDbConfig) -> Result<Self, KvStoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_compression_type(DBCompressionType::Snappy);

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        block_opts.set_block_cache(&Cache::new_lru_cache(config.block_cache_size));
        opts.set_block_based_table_factory(&block_opts);

        let db = DB::open(&opts, &config.path).map_err(|e| KvStoreError::IoError {
            message: format!("failed to open rocksdb at {}: {e}", config.path),
        })?;
        Ok(Self { db, config })
    }

    pub fn open_default(path: impl AsRef<Path>) -> Result<Self, KvStoreError> {
        Self::open(RocksDbConfig {
            path: path.as_ref().to_string_lossy().to_string(),
            ..Default::default()
        })
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

impl KeyValueStore for RocksDbStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvStoreError> {
        self.db.get(key).map_err(|e| KvStoreError::IoError {
            message: format!("rocksdb get failed: {e}"),
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvStoreError> {
        self.db
            .put_opt(key, value, &self.write_opts())
            .map_err(|e| KvStoreError::IoError {
                message: format!("rocksdb put failed: {e}"),
            })
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvStoreError> {
        self.db
            .delete_opt(key, &self.write_opts())
            .map_err(|e| KvStoreError::IoError {
                message: format!("rocksdb delete failed: {e}"),
            })
    }
}
