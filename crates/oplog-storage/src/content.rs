//! Content-addressed block storage.
//!
//! Keys are the lowercase hex SHA-256 of their values. Writes with any other
//! key are refused and reads re-hash what the inner backend returns, so a
//! block that rots on disk surfaces as [`StorageError::CorruptBlock`] instead
//! of being handed to the log.

use oplog_core::Hasher;
use tracing::warn;

use crate::error::StorageError;
use crate::traits::{KeyValueStream, Storage, WriteBatch};

/// Wraps any backend and enforces `key == hex(sha256(value))`.
#[derive(Debug)]
pub struct ContentAddressedStorage<S> {
    inner: S,
}

impl<S: Storage> ContentAddressedStorage<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// The key a value is stored under.
    pub fn address(value: &[u8]) -> String {
        Hasher::hash(value).to_hex()
    }

    /// Store a block and return its address.
    pub async fn put_block(&self, value: &[u8]) -> Result<String, StorageError> {
        let key = Self::address(value);
        self.inner.put(&key, value).await?;
        Ok(key)
    }

    fn check(key: &str, value: &[u8]) -> Result<(), StorageError> {
        let actual = Self::address(value);
        if actual != key {
            return Err(StorageError::ContentMismatch {
                key: key.to_string(),
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Storage> Storage for ContentAddressedStorage<S> {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        Self::check(key, value)?;
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(value) = self.inner.get(key).await? else {
            return Ok(None);
        };
        let actual = Self::address(&value);
        if actual != key {
            warn!(key, %actual, "corrupt block in content-addressed storage");
            return Err(StorageError::CorruptBlock {
                key: key.to_string(),
                actual,
            });
        }
        Ok(Some(value))
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.inner.del(key).await
    }

    fn iter(&self) -> KeyValueStream<'_> {
        self.inner.iter()
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.clear().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.close().await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        for (key, value) in &batch.puts {
            Self::check(key, value)?;
        }
        self.inner.apply(batch).await
    }
}
