//! The storage contract shared by every backend.

use crate::error::StorageError;
use futures::stream::BoxStream;
use futures::TryStreamExt;

/// Lazy, finite sequence of `(key, value)` pairs.
pub type KeyValueStream<'a> = BoxStream<'a, Result<(String, Vec<u8>), StorageError>>;

/// A set of writes applied together: puts first, then deletes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub puts: Vec<(String, Vec<u8>)>,
    pub deletes: Vec<String>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.puts.push((key.into(), value.into()));
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.deletes.push(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.puts.len() + self.deletes.len()
    }
}

/// Uniform key to bytes storage.
///
/// All implementations must be `Send + Sync` for use across async tasks.
/// Once [`Storage::close`] has been called every operation must fail with
/// [`StorageError::Closed`].
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Returns `None` if the key is absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), StorageError>;

    /// Stream every pair. Each call starts a fresh pass.
    fn iter(&self) -> KeyValueStream<'_>;

    /// Copy every pair of `other` into this store.
    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        let mut pairs = other.iter();
        while let Some((key, value)) = pairs.try_next().await? {
            self.put(&key, &value).await?;
        }
        Ok(())
    }

    /// Remove every pair.
    async fn clear(&self) -> Result<(), StorageError>;

    /// Release the backend.
    async fn close(&self) -> Result<(), StorageError>;

    /// Apply a batch. Backends with transactions override this to make the
    /// whole batch atomic.
    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        for (key, value) in &batch.puts {
            self.put(key, value).await?;
        }
        for key in &batch.deletes {
            self.del(key).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        (**self).put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).get(key).await
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        (**self).del(key).await
    }

    fn iter(&self) -> KeyValueStream<'_> {
        (**self).iter()
    }

    async fn merge(&self, other: &dyn Storage) -> Result<(), StorageError> {
        (**self).merge(other).await
    }

    async fn clear(&self) -> Result<(), StorageError> {
        (**self).clear().await
    }

    async fn close(&self) -> Result<(), StorageError> {
        (**self).close().await
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        (**self).apply(batch).await
    }
}
