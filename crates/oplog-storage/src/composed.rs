//! Layered storage.
//!
//! Layers are ordered from fastest to slowest, e.g. a [`MemoryStorage`] cache
//! in front of a [`RedbStorage`] file. Reads stop at the first layer holding
//! the key and copy the value into every faster layer. Writes go to all
//! layers.
//!
//! [`MemoryStorage`]: crate::MemoryStorage
//! [`RedbStorage`]: crate::RedbStorage

use std::collections::HashSet;
use std::sync::Arc;

use futures::TryStreamExt;
use tracing::{trace, warn};

use crate::error::StorageError;
use crate::traits::{KeyValueStream, Storage, WriteBatch};

pub struct ComposedStorage {
    layers: Vec<Arc<dyn Storage>>,
}

impl ComposedStorage {
    /// Compose `layers`, front (fastest) first.
    pub fn new(layers: Vec<Arc<dyn Storage>>) -> Self {
        Self { layers }
    }

    /// Convenience for the common cache-in-front-of-backend pair.
    pub fn cached(cache: Arc<dyn Storage>, backend: Arc<dyn Storage>) -> Self {
        Self::new(vec![cache, backend])
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }
}

impl std::fmt::Debug for ComposedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComposedStorage")
            .field("layers", &self.layers.len())
            .finish()
    }
}

#[async_trait::async_trait]
impl Storage for ComposedStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        for layer in &self.layers {
            layer.put(key, value).await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        for (depth, layer) in self.layers.iter().enumerate() {
            let Some(value) = layer.get(key).await? else {
                continue;
            };
            for faster in &self.layers[..depth] {
                // A failed back-fill only costs a future cache miss.
                if let Err(e) = faster.put(key, &value).await {
                    warn!(key, error = %e, "failed to populate faster storage layer");
                }
            }
            if depth > 0 {
                trace!(key, depth, "storage hit below front layer");
            }
            return Ok(Some(value));
        }
        Ok(None)
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        for layer in &self.layers {
            layer.del(key).await?;
        }
        Ok(())
    }

    fn iter(&self) -> KeyValueStream<'_> {
        Box::pin(async_stream::try_stream! {
            let mut seen = HashSet::new();
            for layer in &self.layers {
                let mut pairs = layer.iter();
                while let Some((key, value)) = pairs.try_next().await? {
                    if seen.insert(key.clone()) {
                        yield (key, value);
                    }
                }
            }
        })
    }

    async fn clear(&self) -> Result<(), StorageError> {
        for layer in &self.layers {
            layer.clear().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut first_error = None;
        for layer in &self.layers {
            if let Err(e) = layer.close().await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        // Slowest layer first so a failure never leaves a cache ahead of the backend.
        for layer in self.layers.iter().rev() {
            layer.apply(batch.clone()).await?;
        }
        Ok(())
    }
}
