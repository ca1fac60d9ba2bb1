//! In-memory storage backend.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream;
use parking_lot::RwLock;
use tracing::trace;

use crate::error::StorageError;
use crate::traits::{KeyValueStream, Storage, WriteBatch};

/// In-memory store backed by a `RwLock<BTreeMap>`.
///
/// Used for tests, for caches in front of slower layers, and for logs that
/// do not need to survive a restart. Iteration is in key order over a
/// snapshot taken when the stream is created.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pairs: RwLock<BTreeMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.check_open()?;
        trace!(key, size = value.len(), "memory put");
        self.pairs.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.check_open()?;
        Ok(self.pairs.read().get(key).cloned())
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        self.check_open()?;
        self.pairs.write().remove(key);
        Ok(())
    }

    fn iter(&self) -> KeyValueStream<'_> {
        if let Err(e) = self.check_open() {
            return Box::pin(stream::once(async move { Err(e) }));
        }
        let snapshot: Vec<_> = self
            .pairs
            .read()
            .iter()
            .map(|(k, v)| Ok((k.clone(), v.clone())))
            .collect();
        Box::pin(stream::iter(snapshot))
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.check_open()?;
        self.pairs.write().clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        self.check_open()?;
        let mut pairs = self.pairs.write();
        for (key, value) in batch.puts {
            pairs.insert(key, value);
        }
        for key in batch.deletes {
            pairs.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_put_get_del() {
        let store = MemoryStorage::new();
        store.put("a", b"1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));

        store.del("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        // deleting again is fine
        store.del("a").await.unwrap();
    }

    #[tokio::test]
    async fn test_iter_is_ordered_and_restartable() {
        let store = MemoryStorage::new();
        store.put("b", b"2").await.unwrap();
        store.put("a", b"1").await.unwrap();

        let first: Vec<_> = store.iter().try_collect().await.unwrap();
        let second: Vec<_> = store.iter().try_collect().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].0, "a");
        assert_eq!(first[1].0, "b");
    }

    #[tokio::test]
    async fn test_merge_copies_everything() {
        let a = MemoryStorage::new();
        let b = MemoryStorage::new();
        a.put("x", b"1").await.unwrap();
        b.put("y", b"2").await.unwrap();

        a.merge(&b).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_batch() {
        let store = MemoryStorage::new();
        store.put("old", b"0").await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("new", b"1".to_vec()).delete("old");
        store.apply(batch).await.unwrap();

        assert_eq!(store.get("old").await.unwrap(), None);
        assert_eq!(store.get("new").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_clear_and_close() {
        let store = MemoryStorage::new();
        store.put("a", b"1").await.unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty());

        store.close().await.unwrap();
        assert!(matches!(store.put("a", b"1").await, Err(StorageError::Closed)));
        assert!(matches!(store.get("a").await, Err(StorageError::Closed)));
        let items: Vec<_> = futures::StreamExt::collect(store.iter()).await;
        assert!(matches!(items.as_slice(), [Err(StorageError::Closed)]));
    }
}
