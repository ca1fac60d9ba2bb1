//! Error types for log operations.

use oplog_core::{CodecError, EntryError, Hash, IdentityError};
use oplog_storage::StorageError;
use thiserror::Error;

/// Errors returned by [`Log`](crate::Log) operations.
///
/// Every error is scoped to the call that produced it: the log's heads and
/// index are exactly as they were before the call began.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("entry belongs to log {found}, expected {expected}")]
    IdMismatch { expected: String, found: String },

    #[error("identity {identity} is not allowed to write entry {hash}")]
    AccessDenied { hash: Hash, identity: String },

    #[error("invalid signature on entry {0}")]
    InvalidSignature(Hash),

    #[error("entry claims address {claimed} but hashes to {computed}")]
    HashMismatch { claimed: Hash, computed: Hash },

    /// An entry whose clock runs behind one of its parents.
    #[error("entry {hash} has an earlier clock than its parent {parent}")]
    ClockRegression { hash: Hash, parent: Hash },

    #[error("missing ancestor {0}")]
    MissingAncestor(Hash),

    #[error("timed out fetching ancestor {0}")]
    AncestorTimeout(Hash),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("signing error: {0}")]
    Signing(#[from] IdentityError),

    /// Persisted log state that contradicts itself.
    #[error("corrupt log state: {0}")]
    Corrupt(String),

    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Whether the same call may succeed later, e.g. once a missing
    /// ancestor becomes available.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LogError::MissingAncestor(_) | LogError::AncestorTimeout(_) | LogError::Storage(_)
        )
    }

    /// Whether the error is a verdict on the entry itself rather than on
    /// the environment.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LogError::IdMismatch { .. }
                | LogError::AccessDenied { .. }
                | LogError::InvalidSignature(_)
                | LogError::HashMismatch { .. }
                | LogError::ClockRegression { .. }
        )
    }
}

impl From<EntryError> for LogError {
    fn from(e: EntryError) -> Self {
        match e {
            EntryError::Signing(e) => LogError::Signing(e),
            EntryError::Codec(e) => LogError::Codec(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, LogError>;
