//! Log entries and their builder.
//!
//! An entry is one operation of the log together with its causal metadata:
//! - `next`: the heads the writer saw when it appended (direct parents)
//! - `refs`: older ancestors kept as skip-links for faster backward walks
//! - `clock`: the logical time used for deterministic read ordering
//!
//! The entry's [`Hash`] is the SHA-256 of its block encoding, so any change to
//! any field changes its address. The signature covers every field except
//! `sig` and `hash`.

use crate::clock::Clock;
use crate::codec::{field_len, set_len, CodecError, Decoder, Encoder};
use crate::hash::{Hash, Hasher};
use crate::identity::{key_id, IdentityError, IdentityVerifier, Signer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Current encoding version written into `v`.
pub const ENTRY_VERSION: u32 = 2;

/// Why an entry could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error(transparent)]
    Signing(#[from] IdentityError),

    /// A field too large for the block encoding.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// An immutable, signed, content-addressed log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Content address, the SHA-256 of [`Entry::to_bytes`].
    pub hash: Hash,

    /// Id of the log this entry belongs to.
    pub id: String,

    /// Operation data, opaque to the log.
    pub payload: Vec<u8>,

    /// Direct causal predecessors.
    pub next: BTreeSet<Hash>,

    /// Additional ancestors for skipping back through long chains.
    pub refs: BTreeSet<Hash>,

    pub clock: Clock,

    /// Public key of the signer.
    pub key: Vec<u8>,

    /// Hash of the identity object that produced this entry.
    pub identity: Hash,

    pub sig: Vec<u8>,

    /// Encoding version.
    pub v: u32,
}

/// Sort key giving the deterministic total order of entries:
/// clock time, then clock id, then hash.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    pub clock: Clock,
    pub hash: Hash,
}

impl Entry {
    /// Create and sign a new entry.
    pub fn create(
        id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        next: BTreeSet<Hash>,
        refs: BTreeSet<Hash>,
        clock: Clock,
        signer: &dyn Signer,
    ) -> Result<Entry, EntryError> {
        EntryBuilder::new(id)
            .with_payload(payload)
            .with_next(next)
            .with_refs(refs)
            .with_clock(clock)
            .sign(signer)
    }

    /// The bytes covered by the signature: every field except `sig` and `hash`.
    pub fn signable_bytes(&self) -> Vec<u8> {
        self.encoder().finish()
    }

    /// The canonical block encoding, the value stored under [`Entry::hash`].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = self.encoder();
        enc.bytes(&self.sig);
        enc.finish()
    }

    fn encoder(&self) -> Encoder {
        let mut enc = Encoder::with_capacity(128 + self.payload.len());
        enc.u32(self.v)
            .str(&self.id)
            .bytes(&self.payload)
            .hash_set(&self.next)
            .hash_set(&self.refs)
            .str(&self.clock.id)
            .u64(self.clock.time)
            .bytes(&self.key)
            .hash(&self.identity);
        enc
    }

    /// Decode a block. The hash is recomputed from the bytes, never trusted.
    pub fn from_bytes(bytes: &[u8]) -> Result<Entry, CodecError> {
        let mut dec = Decoder::new(bytes);
        let v = dec.u32()?;
        if v != ENTRY_VERSION {
            return Err(CodecError::UnsupportedVersion(v));
        }
        let id = dec.str()?;
        let payload = dec.bytes()?;
        let next = dec.hash_set()?;
        let refs = dec.hash_set()?;
        let clock_id = dec.str()?;
        let time = dec.u64()?;
        let key = dec.bytes()?;
        let identity = dec.hash()?;
        let sig = dec.bytes()?;
        dec.finish()?;

        Ok(Entry {
            hash: Hasher::hash(bytes),
            id,
            payload,
            next,
            refs,
            clock: Clock::new(clock_id, time),
            key,
            identity,
            sig,
            v,
        })
    }

    /// Fails if a field is too large to encode.
    pub fn check_lengths(&self) -> Result<(), CodecError> {
        for len in [
            self.id.len(),
            self.payload.len(),
            self.clock.id.len(),
            self.key.len(),
            self.sig.len(),
        ] {
            field_len(len)?;
        }
        set_len(self.next.len())?;
        set_len(self.refs.len())?;
        Ok(())
    }

    /// Recompute the content address from the entry's fields.
    pub fn compute_hash(&self) -> Hash {
        Hasher::hash(&self.to_bytes())
    }

    /// Check that the stored hash matches the entry's contents.
    pub fn verify_hash(&self) -> bool {
        self.compute_hash() == self.hash
    }

    /// Check the signature with the given verifier. Malformed signatures
    /// simply fail.
    pub fn verify_signature(&self, verifier: &dyn IdentityVerifier) -> bool {
        verifier.verify(self)
    }

    /// All referenced ancestors, `next` first then `refs`.
    pub fn parents(&self) -> impl Iterator<Item = &Hash> {
        self.next.iter().chain(self.refs.difference(&self.next))
    }

    /// True for entries with no ancestors.
    pub fn is_root(&self) -> bool {
        self.next.is_empty() && self.refs.is_empty()
    }

    pub fn sort_key(&self) -> EntryKey {
        EntryKey {
            clock: self.clock.clone(),
            hash: self.hash,
        }
    }

    /// Hex id of the signing key.
    pub fn author(&self) -> String {
        key_id(&self.key)
    }
}

/// Builder for signed entries.
#[derive(Clone, Debug, Default)]
pub struct EntryBuilder {
    id: String,
    payload: Vec<u8>,
    next: BTreeSet<Hash>,
    refs: BTreeSet<Hash>,
    clock: Option<Clock>,
}

impl EntryBuilder {
    /// Start an entry for the log `id`.
    pub fn new(id: impl Into<String>) -> Self {
        EntryBuilder {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_next(mut self, next: BTreeSet<Hash>) -> Self {
        self.next = next;
        self
    }

    pub fn with_parent(mut self, parent: Hash) -> Self {
        self.next.insert(parent);
        self
    }

    pub fn with_refs(mut self, refs: BTreeSet<Hash>) -> Self {
        self.refs = refs;
        self
    }

    /// Set the clock. Without one, the signer's id at time 1 is used.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sign the entry and compute its content address.
    pub fn sign(self, signer: &dyn Signer) -> Result<Entry, EntryError> {
        let clock = self.clock.unwrap_or_else(|| Clock::new(signer.id(), 1));
        let mut entry = Entry {
            hash: Hash::from_bytes([0u8; 32]),
            id: self.id,
            payload: self.payload,
            next: self.next,
            refs: self.refs,
            clock,
            key: signer.public_key().to_vec(),
            identity: signer.identity(),
            sig: Vec::new(),
            v: ENTRY_VERSION,
        };
        entry.check_lengths()?;
        entry.sig = signer.sign(&entry.signable_bytes())?;
        field_len(entry.sig.len())?;
        entry.hash = entry.compute_hash();
        Ok(entry)
    }
}
