//! Access controllers decide who may write to a log.
//!
//! Authorization is separate from authenticity: an entry can carry a valid
//! signature and still be refused because its author is not a writer.

use async_trait::async_trait;
use oplog_core::Entry;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Id that grants write access to every identity.
pub const ANY_WRITER: &str = "*";

/// Authorization policy consulted for every appended or joined entry.
///
/// Implementations are shared across concurrent joins and must not touch
/// log state.
#[async_trait]
pub trait AccessController: Send + Sync {
    async fn can_append(&self, entry: &Entry) -> bool;
}

/// Lets every identity write.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

#[async_trait]
impl AccessController for OpenAccess {
    async fn can_append(&self, _entry: &Entry) -> bool {
        true
    }
}

/// Lets only listed identity ids write.
///
/// Ids are the hex public keys of the signers (see [`Entry::author`]).
/// The list can change while the log is open; [`ANY_WRITER`] admits everyone.
#[derive(Debug, Default)]
pub struct AllowList {
    writers: RwLock<BTreeSet<String>>,
}

impl AllowList {
    pub fn new<I, S>(writers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            writers: RwLock::new(writers.into_iter().map(Into::into).collect()),
        }
    }

    pub fn grant(&self, id: impl Into<String>) {
        self.writers.write().insert(id.into());
    }

    /// Entries already in a log stay there; only future appends and joins
    /// are affected.
    pub fn revoke(&self, id: &str) -> bool {
        self.writers.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        let writers = self.writers.read();
        writers.contains(ANY_WRITER) || writers.contains(id)
    }

    pub fn writers(&self) -> Vec<String> {
        self.writers.read().iter().cloned().collect()
    }
}

#[async_trait]
impl AccessController for AllowList {
    async fn can_append(&self, entry: &Entry) -> bool {
        self.contains(&entry.author())
    }
}
