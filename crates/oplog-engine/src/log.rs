//! The log engine: an open replica of one operation log.
//!
//! Mutations (`append`, `join_entry`, `join_log`, `rebuild_heads`) queue on a
//! per-log FIFO write lane. Reads work on an immutable snapshot of the state
//! that a mutation swaps in only after its writes are persisted.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use oplog_core::{Clock, Ed25519Verifier, Entry, Hash, IdentityVerifier, Signer};
use oplog_storage::{Storage, WriteBatch};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::access::{AccessController, OpenAccess};
use crate::error::{LogError, Result};
use crate::fetch::{read_entry, EntryFetcher};
use crate::join::causal_order;
use crate::options::LogOptions;
use crate::state::{decode_clock, encode_clock, LogState};
use crate::stores::{LogStorage, HEADS_TABLE, INDEX_TABLE, PENDING_COMMIT};

/// Stream of entries in read order.
pub type EntryStream<'a> = BoxStream<'a, Result<Entry>>;

/// Handle to an open log. Clones share the same replica.
#[derive(Clone)]
pub struct Log {
    pub(crate) inner: Arc<LogInner>,
}

pub(crate) struct LogInner {
    pub id: String,
    pub storage: LogStorage,
    pub access: Arc<dyn AccessController>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub fetcher: Option<Arc<dyn EntryFetcher>>,
    pub options: LogOptions,
    state: RwLock<Arc<LogState>>,
    write_lane: Mutex<()>,
    closed: AtomicBool,
    /// A stepwise commit failed after placing its marker. The marker is
    /// kept until the next open rebuilds heads.
    interrupted: AtomicBool,
}

/// Builder for opening a [`Log`].
pub struct LogBuilder {
    id: String,
    storage: Option<LogStorage>,
    access: Arc<dyn AccessController>,
    verifier: Arc<dyn IdentityVerifier>,
    fetcher: Option<Arc<dyn EntryFetcher>>,
    options: LogOptions,
}

impl LogBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            storage: None,
            access: Arc::new(OpenAccess),
            verifier: Arc::new(Ed25519Verifier),
            fetcher: None,
            options: LogOptions::default(),
        }
    }

    pub fn storage(mut self, storage: LogStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn access_controller(mut self, access: Arc<dyn AccessController>) -> Self {
        self.access = access;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Source of ancestors that are not in local entry storage.
    pub fn fetcher(mut self, fetcher: Arc<dyn EntryFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn options(mut self, options: LogOptions) -> Self {
        self.options = options;
        self
    }

    /// Open the log, loading heads and index from storage.
    ///
    /// Entry storage is never scanned: entries that are stored but were not
    /// indexed stay outside the log until they are joined.
    pub async fn open(self) -> Result<Log> {
        let storage = self.storage.unwrap_or_else(LogStorage::memory);

        let mut state = load_index(storage.index.as_ref()).await?;
        let stored_heads = load_heads(storage.heads.as_ref()).await?;
        let heads: BTreeSet<Hash> = stored_heads
            .hashes
            .iter()
            .filter(|h| state.contains(h))
            .copied()
            .collect();
        let dangling = stored_heads.hashes.len() - heads.len();
        state.heads = heads;

        let needs_rebuild = self.options.rebuild_heads_on_open
            || stored_heads.pending
            || dangling > 0
            || (state.heads.is_empty() && state.len() > 0);

        let log = Log {
            inner: Arc::new(LogInner {
                id: self.id,
                storage,
                access: self.access,
                verifier: self.verifier,
                fetcher: self.fetcher,
                options: self.options,
                state: RwLock::new(Arc::new(state)),
                write_lane: Mutex::new(()),
                closed: AtomicBool::new(false),
                interrupted: AtomicBool::new(false),
            }),
        };

        if needs_rebuild {
            if dangling > 0 {
                warn!(log_id = %log.id(), dangling, "stored heads missing from index");
            }
            if stored_heads.pending {
                warn!(log_id = %log.id(), "previous commit did not complete");
            }
            log.rebuild_heads().await?;
        }

        info!(
            log_id = %log.id(),
            entries = log.len(),
            heads = log.head_hashes().len(),
            "opened log"
        );
        Ok(log)
    }
}

async fn load_index(index: &dyn Storage) -> Result<LogState> {
    let mut state = LogState::default();
    let mut pairs = index.iter();
    while let Some((key, value)) = pairs.try_next().await? {
        state.insert(parse_key(&key)?, decode_clock(&value)?);
    }
    Ok(state)
}

struct StoredHeads {
    hashes: BTreeSet<Hash>,
    /// The commit marker was found.
    pending: bool,
}

async fn load_heads(storage: &dyn Storage) -> Result<StoredHeads> {
    let mut stored = StoredHeads {
        hashes: BTreeSet::new(),
        pending: false,
    };
    let mut pairs = storage.iter();
    while let Some((key, _)) = pairs.try_next().await? {
        if key == PENDING_COMMIT {
            stored.pending = true;
        } else {
            stored.hashes.insert(parse_key(&key)?);
        }
    }
    Ok(stored)
}

fn parse_key(key: &str) -> Result<Hash> {
    Hash::from_hex(key).ok_or_else(|| LogError::Corrupt(format!("invalid entry key {key:?}")))
}

impl Log {
    /// Open a log with in-memory storages and default capabilities.
    pub async fn open(id: impl Into<String>) -> Result<Log> {
        LogBuilder::new(id).open().await
    }

    pub fn builder(id: impl Into<String>) -> LogBuilder {
        LogBuilder::new(id)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn options(&self) -> &LogOptions {
        &self.inner.options
    }

    pub(crate) fn snapshot(&self) -> Arc<LogState> {
        self.inner.state.read().clone()
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    /// Wait for the write lane. Fails if the log was closed while queued.
    pub(crate) async fn lane(&self) -> Result<MutexGuard<'_, ()>> {
        self.check_open()?;
        let guard = self.inner.write_lane.lock().await;
        self.check_open()?;
        Ok(guard)
    }

    pub fn has(&self, hash: &Hash) -> bool {
        self.inner.state.read().contains(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest clock time in the log.
    pub fn clock(&self) -> u64 {
        self.inner.state.read().max_time()
    }

    /// Hashes of the current heads in read order.
    pub fn head_hashes(&self) -> Vec<Hash> {
        self.snapshot().ordered_heads()
    }

    /// The current heads in read order.
    pub async fn heads(&self) -> Result<Vec<Entry>> {
        self.check_open()?;
        let state = self.snapshot();
        let mut heads = Vec::with_capacity(state.heads.len());
        for hash in state.ordered_heads() {
            let entry = match read_entry(self.inner.storage.heads.as_ref(), &hash).await? {
                Some(entry) => entry,
                None => self.load_entry(&hash).await?,
            };
            heads.push(entry);
        }
        Ok(heads)
    }

    /// The entry with this hash, if it is part of the log.
    pub async fn get(&self, hash: &Hash) -> Result<Option<Entry>> {
        self.check_open()?;
        if !self.has(hash) {
            return Ok(None);
        }
        self.load_entry(hash).await.map(Some)
    }

    /// Every entry, in read order.
    pub async fn values(&self) -> Result<Vec<Entry>> {
        self.iterator().try_collect().await
    }

    /// Stream every entry in read order.
    ///
    /// The stream reads from the snapshot taken when it is created; entries
    /// admitted afterwards are not included. Call again for a fresh pass.
    pub fn iterator(&self) -> EntryStream<'_> {
        let state = self.snapshot();
        Box::pin(try_stream! {
            self.check_open()?;
            for key in state.order.iter() {
                let entry = self.load_entry(&key.hash).await?;
                yield entry;
            }
        })
    }

    pub(crate) async fn load_entry(&self, hash: &Hash) -> Result<Entry> {
        read_entry(self.inner.storage.entries.as_ref(), hash)
            .await?
            .ok_or_else(|| {
                LogError::Corrupt(format!("indexed entry {hash} missing from entry storage"))
            })
    }

    /// Append a new entry on top of the current heads.
    ///
    /// The entry's `next` is the full set of heads, so it becomes the only
    /// head.
    pub async fn append(&self, payload: impl Into<Vec<u8>>, signer: &dyn Signer) -> Result<Entry> {
        let _lane = self.lane().await?;
        let state = self.snapshot();

        let next = state.heads.clone();
        let refs = state.skip_links(&next, self.inner.options.reference_count);
        let clock = Clock::successor(signer.id(), state.heads_time());
        let entry = Entry::create(self.id(), payload, next, refs, clock, signer)?;

        if !self.inner.access.can_append(&entry).await {
            warn!(log_id = %self.id(), author = %entry.author(), "append refused by access controller");
            return Err(LogError::AccessDenied {
                hash: entry.hash,
                identity: entry.author(),
            });
        }
        if !entry.verify_signature(self.inner.verifier.as_ref()) {
            return Err(LogError::InvalidSignature(entry.hash));
        }

        let mut updated = (*state).clone();
        updated.insert(entry.hash, entry.clock.clone());
        updated.heads = BTreeSet::from([entry.hash]);
        self.commit(&state.heads, updated, std::slice::from_ref(&entry))
            .await?;

        debug!(
            log_id = %self.id(),
            hash = %entry.hash.short(),
            time = entry.clock.time,
            "appended entry"
        );
        Ok(entry)
    }

    /// Recompute heads from the index and the entry DAG and persist them.
    ///
    /// Heads are the indexed entries no other indexed entry references.
    pub async fn rebuild_heads(&self) -> Result<Vec<Hash>> {
        let _lane = self.lane().await?;
        let state = self.snapshot();

        let mut referenced = HashSet::new();
        for hash in state.index.keys() {
            let entry = self.load_entry(hash).await?;
            referenced.extend(entry.parents().copied());
        }

        let stored = load_heads(self.inner.storage.heads.as_ref()).await?.hashes;
        let mut updated = (*state).clone();
        updated.heads = state
            .index
            .keys()
            .filter(|h| !referenced.contains(*h))
            .copied()
            .collect();
        let heads = updated.ordered_heads();
        self.commit(&stored, updated, &[]).await?;

        info!(log_id = %self.id(), heads = heads.len(), "rebuilt heads");
        Ok(heads)
    }

    /// Persist a state transition, then publish it.
    ///
    /// Blocks go first. Index entries (ancestors before descendants) and the
    /// heads delta follow, atomically when the storage supports it and
    /// bracketed by a commit marker otherwise. A failure at any step leaves
    /// the published snapshot untouched. Anything already written is either
    /// unreferenced blocks or an index prefix that the next open recovers
    /// heads for.
    pub(crate) async fn commit(
        &self,
        prev_heads: &BTreeSet<Hash>,
        next: LogState,
        admitted: &[Entry],
    ) -> Result<()> {
        let storage = &self.inner.storage;

        let mut index = WriteBatch::new();
        if !admitted.is_empty() {
            let mut blocks = WriteBatch::new();
            for entry in admitted {
                blocks.put(entry.hash.to_hex(), entry.to_bytes());
            }
            storage.entries.apply(blocks).await?;

            for entry in causal_order(admitted) {
                index.put(entry.hash.to_hex(), encode_clock(&entry.clock));
            }
        }

        let mut heads = WriteBatch::new();
        for hash in next.heads.difference(prev_heads) {
            let bytes = match admitted.iter().find(|e| e.hash == *hash) {
                Some(entry) => entry.to_bytes(),
                None => self.load_entry(hash).await?.to_bytes(),
            };
            heads.put(hash.to_hex(), bytes);
        }
        for hash in prev_heads.difference(&next.heads) {
            heads.delete(hash.to_hex());
        }

        match storage.tables() {
            Some(tables) => {
                tables
                    .apply(vec![
                        (INDEX_TABLE.to_string(), index),
                        (HEADS_TABLE.to_string(), heads),
                    ])
                    .await?
            }
            None => self.commit_in_steps(index, heads).await?,
        }

        debug!(
            log_id = %self.id(),
            admitted = admitted.len(),
            heads = next.heads.len(),
            "committed"
        );
        *self.inner.state.write() = Arc::new(next);
        Ok(())
    }

    /// Write index then heads to storages without a shared transaction.
    ///
    /// The marker goes in before the index and leaves with the heads batch.
    /// If either write fails it stays, and so does every later marker of
    /// this session, so the next open rebuilds heads from the index.
    async fn commit_in_steps(&self, index: WriteBatch, mut heads: WriteBatch) -> Result<()> {
        let storage = &self.inner.storage;
        if !index.is_empty() {
            storage.heads.put(PENDING_COMMIT, &[]).await?;
        }
        if !self.inner.interrupted.load(Ordering::Acquire) {
            heads.delete(PENDING_COMMIT);
        }

        let written = match storage.index.apply(index).await {
            Ok(()) => storage.heads.apply(heads).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.inner.interrupted.store(true, Ordering::Release);
            warn!(log_id = %self.id(), error = %e, "commit interrupted, heads will be rebuilt on open");
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the log and its storages. Queued writes finish first.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _lane = self.inner.write_lane.lock().await;
        self.inner.storage.close().await?;
        info!(log_id = %self.id(), "closed log");
        Ok(())
    }
}

/// A log serves its own entries to joins elsewhere.
#[async_trait]
impl EntryFetcher for Log {
    async fn fetch(&self, hash: &Hash) -> Result<Option<Entry>> {
        self.get(hash).await
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("id", &self.inner.id)
            .field("entries", &self.len())
            .field("heads", &self.head_hashes().len())
            .finish()
    }
}
