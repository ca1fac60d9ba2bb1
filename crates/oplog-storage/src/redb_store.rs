//! Persistent storage on top of redb.
//!
//! Each [`RedbStorage`] owns one table. Several roles (entries, heads, index)
//! can share a single database file by opening one [`Database`] and handing
//! an `Arc` of it to each role with a different table name. [`RedbTables`]
//! writes to several of those tables in one transaction.
//!
//! redb is synchronous, so every transaction runs on the blocking pool.

use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::StorageError;
use crate::traits::{KeyValueStream, Storage, WriteBatch};

/// Number of pairs read per transaction while iterating.
const PAGE_SIZE: usize = 256;

fn definition(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(name)
}

/// Run a redb transaction off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, StorageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StorageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
}

/// Apply `(table, batch)` pairs inside one write transaction.
fn write_tables(db: &Database, batches: &[(String, WriteBatch)]) -> Result<(), StorageError> {
    let write_txn = db.begin_write()?;
    for (name, batch) in batches {
        let mut table = write_txn.open_table(definition(name))?;
        for (key, value) in &batch.puts {
            table.insert(key.as_str(), value.as_slice())?;
        }
        for key in &batch.deletes {
            table.remove(key.as_str())?;
        }
    }
    write_txn.commit()?;
    Ok(())
}

pub struct RedbStorage {
    db: RwLock<Option<Arc<Database>>>,
    table: String,
}

impl RedbStorage {
    /// Create (or open) a database file for use by one or more storages.
    pub fn create_database(path: impl AsRef<Path>) -> Result<Arc<Database>, StorageError> {
        Ok(Arc::new(Database::create(path)?))
    }

    /// Open a storage with its own database file.
    pub fn open(path: impl AsRef<Path>, table: impl Into<String>) -> Result<Self, StorageError> {
        Self::with_database(Self::create_database(path)?, table)
    }

    /// Open a storage on a table of an already opened database.
    pub fn with_database(
        db: Arc<Database>,
        table: impl Into<String>,
    ) -> Result<Self, StorageError> {
        let table = table.into();
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(definition(&table))?;
        }
        write_txn.commit()?;
        debug!(table = %table, "opened redb storage");

        Ok(Self {
            db: RwLock::new(Some(db)),
            table,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    fn database(&self) -> Result<Arc<Database>, StorageError> {
        self.db.read().clone().ok_or(StorageError::Closed)
    }

    async fn write(&self, batch: WriteBatch) -> Result<(), StorageError> {
        let db = self.database()?;
        let batches = vec![(self.table.clone(), batch)];
        blocking(move || write_tables(&db, &batches)).await
    }

    /// Read up to [`PAGE_SIZE`] pairs with keys strictly after `after`.
    async fn read_page(
        &self,
        after: Option<String>,
    ) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let db = self.database()?;
        let name = self.table.clone();
        blocking(move || {
            let txn = db.begin_read()?;
            let table = txn.open_table(definition(&name))?;

            let lower = match after.as_deref() {
                Some(key) => Bound::Excluded(key),
                None => Bound::Unbounded,
            };
            let mut page = Vec::with_capacity(PAGE_SIZE);
            for pair in table.range::<&str>((lower, Bound::Unbounded))? {
                let (k, v) = pair?;
                page.push((k.value().to_string(), v.value().to_vec()));
                if page.len() == PAGE_SIZE {
                    break;
                }
            }
            Ok(page)
        })
        .await
    }
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage")
            .field("table", &self.table)
            .field("open", &self.db.read().is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl Storage for RedbStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = self.database()?;
        let name = self.table.clone();
        let key = key.to_string();
        blocking(move || {
            let txn = db.begin_read()?;
            let table = txn.open_table(definition(&name))?;
            let value = table.get(key.as_str())?.map(|v| v.value().to_vec());
            Ok(value)
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<(), StorageError> {
        let mut batch = WriteBatch::new();
        batch.delete(key);
        self.write(batch).await
    }

    fn iter(&self) -> KeyValueStream<'_> {
        Box::pin(async_stream::try_stream! {
            let mut cursor: Option<String> = None;
            loop {
                let page = self.read_page(cursor.clone()).await?;
                let done = page.len() < PAGE_SIZE;
                for (key, value) in page {
                    cursor = Some(key.clone());
                    yield (key, value);
                }
                if done {
                    break;
                }
            }
        })
    }

    async fn clear(&self) -> Result<(), StorageError> {
        let db = self.database()?;
        let name = self.table.clone();
        blocking(move || {
            let write_txn = db.begin_write()?;
            write_txn.delete_table(definition(&name))?;
            {
                let _ = write_txn.open_table(definition(&name))?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await?;
        debug!(table = %self.table, "cleared redb storage");
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.db.write().take();
        Ok(())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.write(batch).await
    }
}

/// Atomic writes across several tables of one database.
///
/// Either every batch handed to [`RedbTables::apply`] becomes visible or
/// none of them does.
pub struct RedbTables {
    db: RwLock<Option<Arc<Database>>>,
}

impl RedbTables {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db: RwLock::new(Some(db)),
        }
    }

    /// Write each `(table, batch)` pair in a single transaction.
    pub async fn apply(&self, batches: Vec<(String, WriteBatch)>) -> Result<(), StorageError> {
        let db = self.db.read().clone().ok_or(StorageError::Closed)?;
        let batches: Vec<_> = batches.into_iter().filter(|(_, b)| !b.is_empty()).collect();
        if batches.is_empty() {
            return Ok(());
        }
        blocking(move || write_tables(&db, &batches)).await
    }

    pub fn close(&self) {
        self.db.write().take();
    }
}

impl std::fmt::Debug for RedbTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbTables")
            .field("open", &self.db.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oplog.redb");

        {
            let store = RedbStorage::open(&path, "entries").unwrap();
            store.put("a", b"1").await.unwrap();
            store.close().await.unwrap();
        }

        let store = RedbStorage::open(&path, "entries").unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn test_tables_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let db = RedbStorage::create_database(dir.path().join("shared.redb")).unwrap();
        let heads = RedbStorage::with_database(db.clone(), "heads").unwrap();
        let index = RedbStorage::with_database(db, "index").unwrap();

        heads.put("k", b"head").await.unwrap();
        assert_eq!(index.get("k").await.unwrap(), None);
        assert_eq!(heads.table_name(), "heads");
    }

    #[tokio::test]
    async fn test_iter_pages_through_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStorage::open(dir.path().join("iter.redb"), "t").unwrap();

        let mut batch = WriteBatch::new();
        for i in 0..(PAGE_SIZE * 2 + 7) {
            batch.put(format!("key-{:05}", i), vec![i as u8]);
        }
        store.apply(batch).await.unwrap();

        let pairs: Vec<_> = store.iter().try_collect().await.unwrap();
        assert_eq!(pairs.len(), PAGE_SIZE * 2 + 7);
        assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));

        // restartable
        let again: Vec<_> = store.iter().try_collect().await.unwrap();
        assert_eq!(again, pairs);
    }

    #[tokio::test]
    async fn test_apply_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStorage::open(dir.path().join("batch.redb"), "t").unwrap();
        store.put("gone", b"x").await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put("kept", b"y".to_vec()).delete("gone");
        store.apply(batch).await.unwrap();
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert_eq!(store.get("kept").await.unwrap(), Some(b"y".to_vec()));

        store.clear().await.unwrap();
        let pairs: Vec<_> = store.iter().try_collect().await.unwrap();
        assert!(pairs.is_empty());
    }

    #[tokio::test]
    async fn test_closed_storage_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStorage::open(dir.path().join("closed.redb"), "t").unwrap();
        store.close().await.unwrap();
        assert!(matches!(store.get("a").await, Err(StorageError::Closed)));
        assert!(matches!(store.put("a", b"1").await, Err(StorageError::Closed)));
    }

    #[tokio::test]
    async fn test_tables_commit_together() {
        let dir = tempfile::tempdir().unwrap();
        let db = RedbStorage::create_database(dir.path().join("multi.redb")).unwrap();
        let heads = RedbStorage::with_database(db.clone(), "heads").unwrap();
        let index = RedbStorage::with_database(db.clone(), "index").unwrap();
        let tables = RedbTables::new(db);

        heads.put("old", b"h").await.unwrap();

        let mut head_batch = WriteBatch::new();
        head_batch.put("new", b"h".to_vec()).delete("old");
        let mut index_batch = WriteBatch::new();
        index_batch.put("new", b"c".to_vec());
        tables
            .apply(vec![
                ("heads".to_string(), head_batch),
                ("index".to_string(), index_batch),
            ])
            .await
            .unwrap();

        assert_eq!(heads.get("old").await.unwrap(), None);
        assert_eq!(heads.get("new").await.unwrap(), Some(b"h".to_vec()));
        assert_eq!(index.get("new").await.unwrap(), Some(b"c".to_vec()));

        tables.close();
        assert!(matches!(
            tables.apply(vec![("heads".to_string(), WriteBatch::new())]).await,
            Err(StorageError::Closed)
        ));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_reads_run_on_a_single_threaded_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStorage::open(dir.path().join("rt.redb"), "t").unwrap();
        let store = &store;
        let writes = (0..16u8).map(|i| async move { store.put(&format!("k{i:02}"), &[i]).await });
        futures::future::try_join_all(writes).await.unwrap();

        let pairs: Vec<_> = store.iter().try_collect().await.unwrap();
        assert_eq!(pairs.len(), 16);
        assert_eq!(store.get("k07").await.unwrap(), Some(vec![7]));
    }
}
