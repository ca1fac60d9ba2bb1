//! # oplog-storage
//!
//! Key to bytes storage for the Carnelia OpLog.
//!
//! This crate provides:
//! - The [`Storage`] contract (put/get/del/iter/merge/clear/close)
//! - [`MemoryStorage`] for tests and caches
//! - [`RedbStorage`], a persistent backend on redb, and [`RedbTables`] for
//!   transactions spanning several of its tables
//! - [`ContentAddressedStorage`], which binds keys to the hash of their values
//! - [`ComposedStorage`], which layers fast backends in front of slow ones
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use oplog_storage::{ComposedStorage, ContentAddressedStorage, MemoryStorage, Storage};
//!
//! # futures::executor::block_on(async {
//! let cache = Arc::new(MemoryStorage::new());
//! let backend = Arc::new(MemoryStorage::new());
//! let blocks = ContentAddressedStorage::new(ComposedStorage::cached(cache, backend));
//!
//! let key = blocks.put_block(b"hello").await.unwrap();
//! assert_eq!(blocks.get(&key).await.unwrap(), Some(b"hello".to_vec()));
//! # });
//! ```

mod composed;
mod content;
mod error;
mod memory;
mod redb_store;
mod traits;

pub use composed::ComposedStorage;
pub use content::ContentAddressedStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
pub use redb_store::{RedbStorage, RedbTables};
pub use traits::{KeyValueStream, Storage, WriteBatch};
