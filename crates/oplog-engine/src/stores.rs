//! The three storages behind a log.

use oplog_storage::{
    ComposedStorage, ContentAddressedStorage, MemoryStorage, RedbStorage, RedbTables, Storage,
    StorageError,
};
use std::path::Path;
use std::sync::Arc;

pub const ENTRIES_TABLE: &str = "entries";
pub const HEADS_TABLE: &str = "heads";
pub const INDEX_TABLE: &str = "index";

/// Key in heads storage marking a commit whose index and heads writes may
/// not both have landed.
pub const PENDING_COMMIT: &str = "pending-commit";

/// Storage roles of a log.
///
/// - `entries`: hex hash to block bytes, for every entry the log has seen
/// - `heads`: hex hash to block bytes, for the current heads only
/// - `index`: hex hash to encoded clock, for every admitted entry
///
/// The index is the membership authority. An entry can sit in `entries`
/// without being part of the log.
///
/// When the index and heads live in one redb file they are committed in a
/// single transaction. Otherwise the log brackets each commit with a
/// [`PENDING_COMMIT`] marker in heads storage.
#[derive(Clone)]
pub struct LogStorage {
    pub entries: Arc<dyn Storage>,
    pub heads: Arc<dyn Storage>,
    pub index: Arc<dyn Storage>,
    tables: Option<Arc<RedbTables>>,
}

impl LogStorage {
    pub fn new(
        entries: Arc<dyn Storage>,
        heads: Arc<dyn Storage>,
        index: Arc<dyn Storage>,
    ) -> Self {
        Self {
            entries,
            heads,
            index,
            tables: None,
        }
    }

    /// Volatile storages. Entry storage is content-addressed.
    pub fn memory() -> Self {
        Self::new(
            Arc::new(ContentAddressedStorage::new(MemoryStorage::new())),
            Arc::new(MemoryStorage::new()),
            Arc::new(MemoryStorage::new()),
        )
    }

    /// Durable storages sharing one redb file, one table per role. Entry
    /// reads go through an in-memory cache.
    pub fn redb(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = RedbStorage::create_database(path)?;
        let entries = ComposedStorage::cached(
            Arc::new(MemoryStorage::new()),
            Arc::new(RedbStorage::with_database(db.clone(), ENTRIES_TABLE)?),
        );
        let mut storage = Self::new(
            Arc::new(ContentAddressedStorage::new(entries)),
            Arc::new(RedbStorage::with_database(db.clone(), HEADS_TABLE)?),
            Arc::new(RedbStorage::with_database(db.clone(), INDEX_TABLE)?),
        );
        storage.tables = Some(Arc::new(RedbTables::new(db)));
        Ok(storage)
    }

    /// Writer for the index and heads tables together, when both share a
    /// redb database.
    pub(crate) fn tables(&self) -> Option<&RedbTables> {
        self.tables.as_deref()
    }

    /// Close every role, reporting the first failure.
    pub async fn close(&self) -> Result<(), StorageError> {
        if let Some(tables) = &self.tables {
            tables.close();
        }
        let results = [
            self.heads.close().await,
            self.index.close().await,
            self.entries.close().await,
        ];
        results.into_iter().collect()
    }
}

impl std::fmt::Debug for LogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStorage")
            .field("transactional", &self.tables.is_some())
            .finish_non_exhaustive()
    }
}
