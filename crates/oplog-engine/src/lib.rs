//! # OpLog Engine
//!
//! A replicated, append-only operation log built as a Merkle-CRDT. Each
//! replica holds a set of signed, content-addressed [`Entry`]s forming a DAG
//! through their `next` and `refs` links, plus the *heads*: the entries no
//! other entry references.
//!
//! Replicas converge by exchanging heads and calling [`Log::join_entry`],
//! which pulls in any missing ancestors, verifies them and admits the whole
//! set atomically. Joins are idempotent and order independent.
//!
//! ```
//! use oplog_core::Ed25519Identity;
//! use oplog_engine::Log;
//!
//! # tokio_test::block_on(async {
//! let me = Ed25519Identity::from_seed([1u8; 32]);
//! let ours = Log::open("notes").await.unwrap();
//! let theirs = Log::open("notes").await.unwrap();
//!
//! let entry = ours.append("hello", &me).await.unwrap();
//! theirs.join_log(&ours).await.unwrap();
//!
//! assert!(theirs.has(&entry.hash));
//! assert_eq!(theirs.head_hashes(), vec![entry.hash]);
//! # });
//! ```

pub mod access;
pub mod error;
pub mod fetch;
mod join;
pub mod log;
pub mod options;
mod state;
pub mod stores;

pub use access::{AccessController, AllowList, OpenAccess, ANY_WRITER};
pub use error::{LogError, Result};
pub use fetch::{EntryFetcher, StorageFetcher};
pub use log::{EntryStream, Log, LogBuilder};
pub use options::{LogOptions, LogOptionsBuilder};
pub use stores::LogStorage;

pub use oplog_core::{Entry, Hash};
