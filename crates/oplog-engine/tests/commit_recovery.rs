//! Logs reopened after a commit failed halfway through.

use async_trait::async_trait;
use futures::TryStreamExt;
use oplog_core::{Ed25519Identity, Hash};
use oplog_engine::stores::PENDING_COMMIT;
use oplog_engine::{Log, LogError, LogStorage};
use oplog_storage::{KeyValueStream, MemoryStorage, Storage, StorageError, WriteBatch};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Memory storage whose batch writes can be made to fail.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
}

impl FlakyStorage {
    fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.inner.put(key, value).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.inner.get(key).await
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
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Other("disk full".into()));
        }
        self.inner.apply(batch).await
    }
}

struct Harness {
    storage: LogStorage,
    heads: Arc<FlakyStorage>,
    index: Arc<FlakyStorage>,
}

impl Harness {
    fn new() -> Self {
        let heads = Arc::new(FlakyStorage::default());
        let index = Arc::new(FlakyStorage::default());
        let storage = LogStorage::new(
            Arc::new(MemoryStorage::new()),
            heads.clone(),
            index.clone(),
        );
        Self {
            storage,
            heads,
            index,
        }
    }

    async fn open(&self) -> Log {
        Log::builder("log")
            .storage(self.storage.clone())
            .open()
            .await
            .unwrap()
    }
}

fn me() -> Ed25519Identity {
    Ed25519Identity::from_seed([1u8; 32])
}

#[tokio::test]
async fn test_failed_heads_write_is_recovered_on_open() {
    let harness = Harness::new();
    let log = harness.open().await;
    let a = log.append("a", &me()).await.unwrap();

    harness.heads.fail(true);
    let err = log.append("b", &me()).await.unwrap_err();
    assert!(matches!(err, LogError::Storage(_)));
    assert_eq!(log.len(), 1);
    assert_eq!(log.head_hashes(), vec![a.hash]);
    harness.heads.fail(false);

    // the index already holds b
    let reopened = harness.open().await;
    assert_eq!(reopened.len(), 2);
    let values = reopened.values().await.unwrap();
    let b = &values[1];
    assert_eq!(b.next, BTreeSet::from([a.hash]));
    assert_eq!(reopened.head_hashes(), vec![b.hash]);
    assert_eq!(harness.heads.get(PENDING_COMMIT).await.unwrap(), None);
}

#[tokio::test]
async fn test_failed_index_write_leaves_log_unchanged_after_open() {
    let harness = Harness::new();
    let log = harness.open().await;
    let a = log.append("a", &me()).await.unwrap();

    harness.index.fail(true);
    assert!(log.append("b", &me()).await.is_err());
    harness.index.fail(false);

    let reopened = harness.open().await;
    assert_eq!(reopened.len(), 1);
    assert_eq!(reopened.head_hashes(), vec![a.hash]);
    assert_eq!(harness.heads.get(PENDING_COMMIT).await.unwrap(), None);

    let b = reopened.append("b", &me()).await.unwrap();
    assert_eq!(b.next, BTreeSet::from([a.hash]));
}

#[tokio::test]
async fn test_marker_survives_later_commits_of_the_same_session() {
    let harness = Harness::new();
    let log = harness.open().await;
    let a = log.append("a", &me()).await.unwrap();

    harness.heads.fail(true);
    assert!(log.append("b", &me()).await.is_err());
    harness.heads.fail(false);

    // c is built on the published heads, which never saw b
    let c = log.append("c", &me()).await.unwrap();
    assert_eq!(c.next, BTreeSet::from([a.hash]));
    assert_eq!(
        harness.heads.get(PENDING_COMMIT).await.unwrap(),
        Some(Vec::new())
    );

    let reopened = harness.open().await;
    assert_eq!(reopened.len(), 3);
    let heads: BTreeSet<Hash> = reopened.head_hashes().into_iter().collect();
    assert_eq!(heads.len(), 2);
    assert!(heads.contains(&c.hash));
    assert!(!heads.contains(&a.hash));
}

#[tokio::test]
async fn test_redb_log_commits_without_marker() {
    let dir = tempfile::tempdir().unwrap();
    let storage = LogStorage::redb(dir.path().join("log.redb")).unwrap();
    let log = Log::builder("log")
        .storage(storage.clone())
        .open()
        .await
        .unwrap();

    log.append("a", &me()).await.unwrap();
    let b = log.append("b", &me()).await.unwrap();

    let pairs: Vec<(String, Vec<u8>)> = storage.heads.iter().try_collect().await.unwrap();
    let keys: Vec<String> = pairs.into_iter().map(|(key, _)| key).collect();
    assert_eq!(keys, vec![b.hash.to_hex()]);
    assert!(storage.index.get(&b.hash.to_hex()).await.unwrap().is_some());
}
