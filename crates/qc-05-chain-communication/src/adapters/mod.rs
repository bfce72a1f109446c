//! # Adapters
//!
//! Concrete implementations of outbound ports owned by this crate.
//!
//! | Adapter | Port |
//! |---------|------|
//! | [`CacheDb`] | seen-commits cache over any [`KeyValueStore`](crate::ports::KeyValueStore) |
//! | [`InMemoryKvStore`] | `KeyValueStore` |
//! | `RocksDbStore` (feature `rocksdb`) | `KeyValueStore` |
//! | [`LocalSigner`] | `NodeSigner` |

pub mod cache_db;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
pub mod signer;

pub use cache_db::{seen_commits_key, CacheDb};
pub use memory::InMemoryKvStore;
#[cfg(feature = "rocksdb")]
pub use self::rocksdb::{RocksDbConfig, RocksDbStore};
pub use signer::LocalSigner;
