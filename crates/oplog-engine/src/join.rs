//! Joining entries from other replicas.
//!
//! A join walks backwards from the candidate through `next` and `refs`,
//! fetching whatever the local replica is missing, verifies every entry it
//! collects and commits them all at once. Either the candidate and its whole
//! missing history are admitted, or nothing is.

use futures::future::try_join_all;
use oplog_core::{Entry, Hash};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::error::{LogError, Result};
use crate::fetch::{read_entry, EntryFetcher};
use crate::log::Log;
use crate::state::LogState;

impl Log {
    /// Merge an entry and any missing ancestors into the log.
    ///
    /// Returns `Ok(false)` if the entry was already admitted.
    pub async fn join_entry(&self, entry: Entry) -> Result<bool> {
        self.join(entry, None).await
    }

    /// Like [`Log::join_entry`], with an extra source for missing ancestors.
    pub async fn join_entry_with(&self, entry: Entry, fetcher: &dyn EntryFetcher) -> Result<bool> {
        self.join(entry, Some(fetcher)).await
    }

    /// Join every head of `other`, pulling missing history from it.
    ///
    /// Returns how many heads were newly admitted.
    pub async fn join_log(&self, other: &Log) -> Result<usize> {
        let source: &dyn EntryFetcher = other;
        let mut joined = 0;
        for head in other.heads().await? {
            if self.join(head, Some(source)).await? {
                joined += 1;
            }
        }
        Ok(joined)
    }

    async fn join(&self, entry: Entry, fetcher: Option<&dyn EntryFetcher>) -> Result<bool> {
        self.check_open()?;
        if self.has(&entry.hash) {
            return Ok(false);
        }

        let _lane = self.lane().await?;
        // an earlier queued join may have admitted it
        let state = self.snapshot();
        if state.contains(&entry.hash) {
            return Ok(false);
        }

        let hash = entry.hash;
        let admitted = match self.collect(&state, entry, fetcher).await {
            Ok(admitted) => admitted,
            Err(e) => {
                if e.is_rejection() {
                    warn!(log_id = %self.id(), hash = %hash.short(), error = %e, "rejected entry");
                } else {
                    debug!(log_id = %self.id(), hash = %hash.short(), error = %e, "join failed");
                }
                return Err(e);
            }
        };

        let mut updated = (*state).clone();
        for entry in &admitted {
            updated.insert(entry.hash, entry.clock.clone());
        }
        let superseded: HashSet<Hash> = admitted
            .iter()
            .flat_map(|e| e.parents().copied())
            .collect();
        updated.heads.retain(|h| !superseded.contains(h));
        updated.heads.insert(hash);

        self.commit(&state.heads, updated, &admitted).await?;
        debug!(
            log_id = %self.id(),
            hash = %hash.short(),
            admitted = admitted.len(),
            "joined entry"
        );
        Ok(true)
    }

    /// Verify the candidate and gather it with every missing ancestor.
    ///
    /// Iterative worklist: each round fetches the whole frontier
    /// concurrently, verifies what came back and queues unknown parents.
    async fn collect(
        &self,
        state: &LogState,
        candidate: Entry,
        fetcher: Option<&dyn EntryFetcher>,
    ) -> Result<Vec<Entry>> {
        self.verify(&candidate).await?;

        let mut queued: HashSet<Hash> = HashSet::from([candidate.hash]);
        let mut frontier = unknown_parents(&candidate, state, &mut queued);
        let mut admitted = vec![candidate];

        while !frontier.is_empty() {
            let fetched = try_join_all(
                frontier
                    .iter()
                    .map(|hash| self.fetch_ancestor(hash, fetcher)),
            )
            .await?;

            let mut next_frontier = Vec::new();
            for ancestor in fetched {
                self.verify(&ancestor).await?;
                next_frontier.extend(unknown_parents(&ancestor, state, &mut queued));
                admitted.push(ancestor);
            }
            frontier = next_frontier;
        }

        check_clocks(state, &admitted)?;
        Ok(admitted)
    }

    /// Admission rules shared by the candidate and every ancestor.
    async fn verify(&self, entry: &Entry) -> Result<()> {
        entry.check_lengths()?;
        if entry.id != self.id() {
            return Err(LogError::IdMismatch {
                expected: self.id().to_string(),
                found: entry.id.clone(),
            });
        }
        let computed = entry.compute_hash();
        if computed != entry.hash {
            return Err(LogError::HashMismatch {
                claimed: entry.hash,
                computed,
            });
        }
        if !self.inner.access.can_append(entry).await {
            return Err(LogError::AccessDenied {
                hash: entry.hash,
                identity: entry.author(),
            });
        }
        if !entry.verify_signature(self.inner.verifier.as_ref()) {
            return Err(LogError::InvalidSignature(entry.hash));
        }
        Ok(())
    }

    /// Obtain one ancestor within the fetch timeout: local entry storage,
    /// then the log's fetcher, then the per-call fetcher.
    async fn fetch_ancestor(&self, hash: &Hash, fetcher: Option<&dyn EntryFetcher>) -> Result<Entry> {
        let timeout = self.inner.options.fetch_timeout;
        match tokio::time::timeout(timeout, self.lookup(hash, fetcher)).await {
            Err(_) => Err(LogError::AncestorTimeout(*hash)),
            Ok(Ok(Some(entry))) if entry.hash == *hash => Ok(entry),
            Ok(Ok(Some(entry))) => Err(LogError::HashMismatch {
                claimed: *hash,
                computed: entry.hash,
            }),
            Ok(Ok(None)) => Err(LogError::MissingAncestor(*hash)),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn lookup(&self, hash: &Hash, fetcher: Option<&dyn EntryFetcher>) -> Result<Option<Entry>> {
        if let Some(entry) = read_entry(self.inner.storage.entries.as_ref(), hash).await? {
            return Ok(Some(entry));
        }
        if let Some(remote) = &self.inner.fetcher {
            if let Some(entry) = remote.fetch(hash).await? {
                return Ok(Some(entry));
            }
        }
        match fetcher {
            Some(fetcher) => fetcher.fetch(hash).await,
            None => Ok(None),
        }
    }
}

fn unknown_parents(entry: &Entry, state: &LogState, queued: &mut HashSet<Hash>) -> Vec<Hash> {
    entry
        .parents()
        .filter(|h| !state.contains(h) && queued.insert(**h))
        .copied()
        .collect()
}

/// Every entry's time must be at least that of each parent, whether the
/// parent arrives in the same join or is already indexed.
fn check_clocks(state: &LogState, entries: &[Entry]) -> Result<()> {
    let incoming: HashMap<Hash, u64> = entries.iter().map(|e| (e.hash, e.clock.time)).collect();
    for entry in entries {
        for parent in entry.parents() {
            let parent_time = incoming
                .get(parent)
                .copied()
                .or_else(|| state.index.get(parent).map(|clock| clock.time));
            if parent_time.is_some_and(|time| entry.clock.time < time) {
                return Err(LogError::ClockRegression {
                    hash: entry.hash,
                    parent: *parent,
                });
            }
        }
    }
    Ok(())
}

/// Order entries so every entry comes after those of its parents that are
/// in the same set. Iterative, so long chains don't grow the stack.
pub(crate) fn causal_order(entries: &[Entry]) -> Vec<&Entry> {
    let by_hash: HashMap<Hash, &Entry> = entries.iter().map(|e| (e.hash, e)).collect();
    let mut roots: Vec<&Entry> = entries.iter().collect();
    roots.sort_by_key(|e| e.sort_key());

    let mut visited = HashSet::new();
    let mut ordered = Vec::with_capacity(entries.len());
    for root in roots {
        let mut stack = vec![(root, false)];
        while let Some((entry, expanded)) = stack.pop() {
            if expanded {
                ordered.push(entry);
                continue;
            }
            if !visited.insert(entry.hash) {
                continue;
            }
            stack.push((entry, true));
            for parent in entry.parents() {
                if let Some(p) = by_hash.get(parent) {
                    if !visited.contains(parent) {
                        stack.push((*p, false));
                    }
                }
            }
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowList;
    use crate::fetch::StorageFetcher;
    use crate::options::LogOptionsBuilder;
    use crate::stores::LogStorage;
    use async_trait::async_trait;
    use oplog_core::{Clock, Ed25519Identity, EntryBuilder, Signer};
    use oplog_storage::{MemoryStorage, Storage};
    use std::sync::Arc;
    use std::time::Duration;

    fn signer() -> Ed25519Identity {
        Ed25519Identity::from_seed([7u8; 32])
    }

    /// e1 <- e2 <- ... built outside any log.
    fn chain(len: u64, me: &Ed25519Identity) -> Vec<Entry> {
        let mut entries: Vec<Entry> = Vec::new();
        for t in 1..=len {
            let mut builder = EntryBuilder::new("log")
                .with_payload(format!("op {t}"))
                .with_clock(Clock::new(me.id(), t));
            if let Some(prev) = entries.last() {
                builder = builder.with_parent(prev.hash);
            }
            entries.push(builder.sign(me).unwrap());
        }
        entries
    }

    async fn stored(entries: &[Entry]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for e in entries {
            storage.put(&e.hash.to_hex(), &e.to_bytes()).await.unwrap();
        }
        storage
    }

    struct NeverAnswers;

    #[async_trait]
    impl EntryFetcher for NeverAnswers {
        async fn fetch(&self, _hash: &Hash) -> Result<Option<Entry>> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let me = signer();
        let entries = chain(1, &me);
        let log = Log::open("log").await.unwrap();

        assert!(log.join_entry(entries[0].clone()).await.unwrap());
        assert!(!log.join_entry(entries[0].clone()).await.unwrap());
        assert_eq!(log.len(), 1);
        assert_eq!(log.head_hashes(), vec![entries[0].hash]);
    }

    #[tokio::test]
    async fn test_join_pulls_ancestors_from_fetcher() {
        let me = signer();
        let entries = chain(5, &me);
        let source = StorageFetcher::new(stored(&entries).await);
        let log = Log::open("log").await.unwrap();

        assert!(log
            .join_entry_with(entries[4].clone(), &source)
            .await
            .unwrap());
        assert_eq!(log.len(), 5);
        assert_eq!(log.head_hashes(), vec![entries[4].hash]);
        let order: Vec<Hash> = log.values().await.unwrap().iter().map(|e| e.hash).collect();
        let expected: Vec<Hash> = entries.iter().map(|e| e.hash).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_missing_ancestor_admits_nothing() {
        let me = signer();
        let entries = chain(3, &me);
        let log = Log::open("log").await.unwrap();

        let err = log.join_entry(entries[2].clone()).await.unwrap_err();
        assert!(matches!(err, LogError::MissingAncestor(h) if h == entries[1].hash));
        assert!(err.is_retryable());
        assert!(log.is_empty());
        assert!(log.head_hashes().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let me = signer();
        let entries = chain(2, &me);
        let options = LogOptionsBuilder::new()
            .fetch_timeout(Duration::from_millis(20))
            .build();
        let log = Log::builder("log")
            .fetcher(Arc::new(NeverAnswers))
            .options(options)
            .open()
            .await
            .unwrap();

        let err = log.join_entry(entries[1].clone()).await.unwrap_err();
        assert!(matches!(err, LogError::AncestorTimeout(_)));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_log_id_rejected() {
        let me = signer();
        let foreign = EntryBuilder::new("other").with_payload("x").sign(&me).unwrap();
        let log = Log::open("log").await.unwrap();

        let err = log.join_entry(foreign).await.unwrap_err();
        assert!(matches!(err, LogError::IdMismatch { .. }));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_forged_hash_rejected() {
        let me = signer();
        let mut entry = chain(1, &me).remove(0);
        entry.hash = oplog_core::Hasher::hash(b"forged");

        let log = Log::open("log").await.unwrap();
        let err = log.join_entry(entry).await.unwrap_err();
        assert!(matches!(err, LogError::HashMismatch { .. }));
    }

    #[tokio::test]
    async fn test_unauthorized_ancestor_fails_whole_join() {
        let me = signer();
        let other = Ed25519Identity::from_seed([9u8; 32]);
        let root = EntryBuilder::new("log").with_payload("root").sign(&other).unwrap();
        let child = EntryBuilder::new("log")
            .with_payload("child")
            .with_parent(root.hash)
            .with_clock(Clock::new(me.id(), 2))
            .sign(&me)
            .unwrap();

        let log = Log::builder("log")
            .access_controller(Arc::new(AllowList::new([me.id()])))
            .open()
            .await
            .unwrap();
        let source = StorageFetcher::new(stored(&[root]).await);

        let err = log.join_entry_with(child, &source).await.unwrap_err();
        assert!(matches!(err, LogError::AccessDenied { .. }));
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_join_log_merges_branches() {
        let alice = Ed25519Identity::from_seed([1u8; 32]);
        let bob = Ed25519Identity::from_seed([2u8; 32]);
        let a = Log::open("log").await.unwrap();
        let b = Log::open("log").await.unwrap();

        a.append("a1", &alice).await.unwrap();
        b.join_log(&a).await.unwrap();
        let a2 = a.append("a2", &alice).await.unwrap();
        let b2 = b.append("b2", &bob).await.unwrap();

        assert_eq!(a.join_log(&b).await.unwrap(), 1);
        let mut heads = a.head_hashes();
        heads.sort();
        let mut expected = vec![a2.hash, b2.hash];
        expected.sort();
        assert_eq!(heads, expected);
        assert_eq!(a.len(), 3);

        // a merge entry supersedes both tips
        let merge = a.append("merge", &alice).await.unwrap();
        assert_eq!(merge.next.len(), 2);
        assert_eq!(a.head_hashes(), vec![merge.hash]);
    }

    #[tokio::test]
    async fn test_stored_but_unindexed_entries_are_reverified() {
        let me = signer();
        let entries = chain(2, &me);
        let storage = LogStorage::memory();
        storage
            .entries
            .put(&entries[0].hash.to_hex(), &entries[0].to_bytes())
            .await
            .unwrap();

        let log = Log::builder("log").storage(storage).open().await.unwrap();
        assert!(log.is_empty());
        assert!(log.join_entry(entries[1].clone()).await.unwrap());
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_child_behind_parent_clock_rejected() {
        let me = signer();
        let parent = EntryBuilder::new("log")
            .with_payload("parent")
            .with_clock(Clock::new(me.id(), 5))
            .sign(&me)
            .unwrap();
        let child = EntryBuilder::new("log")
            .with_payload("child")
            .with_parent(parent.hash)
            .with_clock(Clock::new(me.id(), 1))
            .sign(&me)
            .unwrap();
        let source = StorageFetcher::new(stored(&[parent.clone()]).await);
        let log = Log::open("log").await.unwrap();

        // parent fetched in the same join
        let err = log.join_entry_with(child.clone(), &source).await.unwrap_err();
        assert!(matches!(
            err,
            LogError::ClockRegression { hash, parent: p } if hash == child.hash && p == parent.hash
        ));
        assert!(err.is_rejection());
        assert!(log.is_empty());

        // parent already indexed
        assert!(log.join_entry(parent.clone()).await.unwrap());
        let err = log.join_entry(child).await.unwrap_err();
        assert!(matches!(err, LogError::ClockRegression { .. }));
        assert_eq!(log.len(), 1);
        assert_eq!(log.head_hashes(), vec![parent.hash]);
    }

    #[tokio::test]
    async fn test_child_with_equal_clock_admitted() {
        let me = signer();
        let parent = EntryBuilder::new("log").with_payload("p").sign(&me).unwrap();
        let child = EntryBuilder::new("log")
            .with_payload("c")
            .with_parent(parent.hash)
            .sign(&me)
            .unwrap();
        assert_eq!(child.clock.time, parent.clock.time);

        let log = Log::open("log").await.unwrap();
        let source = StorageFetcher::new(stored(&[parent.clone()]).await);
        assert!(log.join_entry_with(child.clone(), &source).await.unwrap());
        let values: Vec<Hash> = log.values().await.unwrap().iter().map(|e| e.hash).collect();
        assert_eq!(values.len(), 2);
        assert_eq!(log.head_hashes(), vec![child.hash]);
    }

    #[tokio::test]
    async fn test_oversized_entry_rejected_before_hashing() {
        let me = signer();
        let mut entry = chain(1, &me).remove(0);
        entry.payload = vec![0u8; oplog_core::MAX_FIELD_LEN + 1];

        let log = Log::open("log").await.unwrap();
        let err = log.join_entry(entry).await.unwrap_err();
        assert!(matches!(err, LogError::Codec(oplog_core::CodecError::TooLong { .. })));
        assert!(log.is_empty());
    }

    #[test]
    fn test_causal_order_puts_parents_first() {
        let me = signer();
        // equal times, so only the links decide
        let root = EntryBuilder::new("log").with_payload("r").sign(&me).unwrap();
        let left = EntryBuilder::new("log")
            .with_payload("l")
            .with_parent(root.hash)
            .sign(&me)
            .unwrap();
        let right = EntryBuilder::new("log")
            .with_payload("r2")
            .with_parent(root.hash)
            .with_parent(left.hash)
            .sign(&me)
            .unwrap();

        let entries = vec![right.clone(), left.clone(), root.clone()];
        let ordered: Vec<Hash> = causal_order(&entries).iter().map(|e| e.hash).collect();
        assert_eq!(ordered, vec![root.hash, left.hash, right.hash]);
    }
}
