//! # oplog-core
//!
//! Entry model for the Carnelia OpLog, a Merkle-CRDT operation log.
//!
//! This crate provides:
//! - Content addresses ([`Hash`]) computed with SHA-256
//! - Signed, immutable log entries and their canonical binary encoding
//! - Logical clocks giving a deterministic read order
//! - Identity capabilities for signing and verifying entries (ed25519)
//!
//! ## Example
//!
//! ```rust
//! use oplog_core::{Clock, Ed25519Identity, Ed25519Verifier, Entry, EntryBuilder, Signer};
//!
//! let alice = Ed25519Identity::from_seed([1u8; 32]);
//!
//! let first = EntryBuilder::new("log-A")
//!     .with_payload("Entry 1")
//!     .with_clock(Clock::new(alice.id(), 1))
//!     .sign(&alice)
//!     .unwrap();
//!
//! let second = EntryBuilder::new("log-A")
//!     .with_payload("Entry 2")
//!     .with_parent(first.hash)
//!     .with_clock(Clock::new(alice.id(), 2))
//!     .sign(&alice)
//!     .unwrap();
//!
//! assert!(second.verify_signature(&Ed25519Verifier));
//! assert_eq!(Entry::from_bytes(&second.to_bytes()).unwrap(), second);
//! ```

mod clock;
mod codec;
mod entry;
mod hash;
mod identity;

pub use clock::Clock;
pub use codec::{field_len, set_len, CodecError, Decoder, Encoder, MAX_FIELD_LEN, MAX_SET_LEN};
pub use entry::{Entry, EntryBuilder, EntryError, EntryKey, ENTRY_VERSION};
pub use hash::{Hash, Hasher, ParseHashError, HASH_LEN};
pub use identity::{
    identity_hash, key_id, Ed25519Identity, Ed25519Verifier, IdentityError, IdentityVerifier,
    Signer, ED25519,
};
