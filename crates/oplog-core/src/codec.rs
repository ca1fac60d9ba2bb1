//! Canonical binary encoding.
//!
//! Independent implementations must produce identical bytes for identical
//! entries, so the layout is fixed: little-endian integers, `u32` length
//! prefixes for strings and byte strings, and hash sets written as a `u32`
//! count followed by 32-byte members in strictly ascending order.
//!
//! The decoder is strict. It rejects anything the encoder could not have
//! produced (short input, trailing bytes, unsorted or duplicated set members,
//! invalid UTF-8), so every accepted byte string has exactly one meaning.
//!
//! Length prefixes are bounded by [`MAX_FIELD_LEN`] and [`MAX_SET_LEN`] on
//! both sides. [`Entry`](crate::Entry) construction and the decoder reject
//! anything larger.

use crate::hash::{Hash, HASH_LEN};
use std::collections::BTreeSet;

/// Largest string or byte string, in bytes.
pub const MAX_FIELD_LEN: usize = 16 * 1024 * 1024;

/// Largest hash set, in members.
pub const MAX_SET_LEN: usize = 65_536;

/// Errors raised while decoding canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after encoded value")]
    TrailingBytes(usize),

    #[error("hash set members are not strictly ascending")]
    UnsortedSet,

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("unsupported encoding version {0}")]
    UnsupportedVersion(u32),

    #[error("length {len} exceeds the limit of {max}")]
    TooLong { len: usize, max: usize },
}

/// Length prefix for a string or byte string.
pub fn field_len(len: usize) -> Result<u32, CodecError> {
    checked_len(len, MAX_FIELD_LEN)
}

/// Count prefix for a hash set.
pub fn set_len(len: usize) -> Result<u32, CodecError> {
    checked_len(len, MAX_SET_LEN)
}

fn checked_len(len: usize, max: usize) -> Result<u32, CodecError> {
    if len > max {
        return Err(CodecError::TooLong { len, max });
    }
    u32::try_from(len).map_err(|_| CodecError::TooLong { len, max })
}

/// Append-only writer for the canonical layout.
///
/// Lengths past the limits are not representable. Check them first with
/// [`field_len`] and [`set_len`]; the writer saturates the prefix, which
/// the decoder then refuses.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Encoder { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Encoder {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn prefix(&mut self, checked: Result<u32, CodecError>) -> &mut Self {
        debug_assert!(checked.is_ok(), "unchecked length prefix: {checked:?}");
        self.u32(checked.unwrap_or(u32::MAX))
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.prefix(field_len(value.len()));
        self.buf.extend_from_slice(value);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn hash(&mut self, value: &Hash) -> &mut Self {
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// A `BTreeSet` iterates in ascending order, which is the canonical order.
    pub fn hash_set(&mut self, set: &BTreeSet<Hash>) -> &mut Self {
        self.prefix(set_len(set.len()));
        for hash in set {
            self.hash(hash);
        }
        self
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over canonical bytes.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + needed];
        self.pos += needed;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.u32()? as usize;
        field_len(len)?;
        Ok(self.take(len)?.to_vec())
    }

    pub fn str(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn hash(&mut self) -> Result<Hash, CodecError> {
        let mut raw = [0u8; HASH_LEN];
        raw.copy_from_slice(self.take(HASH_LEN)?);
        Ok(Hash::from_bytes(raw))
    }

    pub fn hash_set(&mut self) -> Result<BTreeSet<Hash>, CodecError> {
        let count = self.u32()? as usize;
        set_len(count)?;
        // Bound the count by what is actually left before allocating anything.
        let needed = count.saturating_mul(HASH_LEN);
        if needed > self.remaining() {
            return Err(CodecError::Truncated {
                needed,
                remaining: self.remaining(),
            });
        }

        let mut set = BTreeSet::new();
        let mut previous: Option<Hash> = None;
        for _ in 0..count {
            let hash = self.hash()?;
            if previous.is_some_and(|p| p >= hash) {
                return Err(CodecError::UnsortedSet);
            }
            previous = Some(hash);
            set.insert(hash);
        }
        Ok(set)
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}
