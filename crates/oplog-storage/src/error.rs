//! Error types for storage operations.

/// Errors that can occur in a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backend has been closed.
    #[error("storage is closed")]
    Closed,

    /// A content-addressed put whose key is not the digest of the value.
    #[error("content mismatch: key {key} does not address value hashing to {actual}")]
    ContentMismatch { key: String, actual: String },

    /// A stored block no longer hashes to its key.
    #[error("corrupt block {key}: contents hash to {actual}")]
    CorruptBlock { key: String, actual: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("backend storage error: {0}")]
    Backend(#[from] redb::StorageError),

    /// Failure reported by a backend outside this crate.
    #[error("{0}")]
    Other(String),
}
