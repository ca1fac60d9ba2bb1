//! Obtaining entries by hash.
//!
//! Joins pull missing ancestors through [`EntryFetcher`]s. The log's own
//! entry storage is always tried first; a transport layer can plug in a
//! fetcher that asks peers.

use async_trait::async_trait;
use oplog_core::{Entry, Hash};
use oplog_storage::Storage;

use crate::error::{LogError, Result};

/// Source of entries addressed by hash.
#[async_trait]
pub trait EntryFetcher: Send + Sync {
    /// `Ok(None)` when the entry is unknown to this source.
    async fn fetch(&self, hash: &Hash) -> Result<Option<Entry>>;
}

/// Fetches entries from any storage holding block encodings under hex keys.
#[derive(Debug)]
pub struct StorageFetcher<S> {
    storage: S,
}

impl<S: Storage> StorageFetcher<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }
}

/// Read and decode the block stored under `hash`, checking it is really that
/// entry.
pub(crate) async fn read_entry(storage: &dyn Storage, hash: &Hash) -> Result<Option<Entry>> {
    let Some(bytes) = storage.get(&hash.to_hex()).await? else {
        return Ok(None);
    };
    let entry = Entry::from_bytes(&bytes)?;
    if entry.hash != *hash {
        return Err(LogError::HashMismatch {
            claimed: *hash,
            computed: entry.hash,
        });
    }
    Ok(Some(entry))
}

#[async_trait]
impl<S: Storage> EntryFetcher for StorageFetcher<S> {
    async fn fetch(&self, hash: &Hash) -> Result<Option<Entry>> {
        read_entry(&self.storage, hash).await
    }
}
