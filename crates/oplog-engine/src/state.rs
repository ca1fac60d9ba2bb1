//! In-memory view of a log: its heads and the index of admitted entries.
//!
//! A `LogState` is never mutated once published. Writers clone it, apply
//! their changes and swap the new snapshot in, so readers always see a
//! causally closed set of entries.

use oplog_core::{Clock, CodecError, Decoder, Encoder, EntryKey, Hash};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Default)]
pub(crate) struct LogState {
    pub heads: BTreeSet<Hash>,
    pub index: HashMap<Hash, Clock>,
    /// Index entries in read order.
    pub order: BTreeSet<EntryKey>,
}

impl LogState {
    pub fn contains(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns false if the hash was already indexed.
    pub fn insert(&mut self, hash: Hash, clock: Clock) -> bool {
        if self.index.contains_key(&hash) {
            return false;
        }
        self.index.insert(hash, clock.clone());
        self.order.insert(EntryKey { clock, hash });
        true
    }

    /// Largest clock time among the current heads.
    pub fn heads_time(&self) -> u64 {
        self.heads
            .iter()
            .filter_map(|h| self.index.get(h))
            .map(|c| c.time)
            .max()
            .unwrap_or(0)
    }

    pub fn max_time(&self) -> u64 {
        self.order.last().map_or(0, |k| k.clock.time)
    }

    /// Heads in read order. Heads missing from the index sort first.
    pub fn ordered_heads(&self) -> Vec<Hash> {
        let mut keys: Vec<(Option<&Clock>, Hash)> = self
            .heads
            .iter()
            .map(|h| (self.index.get(h), *h))
            .collect();
        keys.sort();
        keys.into_iter().map(|(_, h)| h).collect()
    }

    /// Skip-links for a new entry: entries at distances 2, 4, 8, ... from the
    /// newest, walking back in read order, excluding `next`.
    pub fn skip_links(&self, next: &BTreeSet<Hash>, count: usize) -> BTreeSet<Hash> {
        let mut refs = BTreeSet::new();
        if count == 0 {
            return refs;
        }

        let mut distance = 2usize;
        for (offset, key) in self.order.iter().rev().enumerate() {
            if refs.len() >= count {
                break;
            }
            if offset + 1 < distance {
                continue;
            }
            if !next.contains(&key.hash) {
                refs.insert(key.hash);
            }
            distance = match distance.checked_mul(2) {
                Some(d) => d,
                None => break,
            };
        }
        refs
    }
}

/// Index values are the entry's clock.
pub(crate) fn encode_clock(clock: &Clock) -> Vec<u8> {
    let mut enc = Encoder::with_capacity(clock.id.len() + 12);
    enc.str(&clock.id).u64(clock.time);
    enc.finish()
}

pub(crate) fn decode_clock(bytes: &[u8]) -> Result<Clock, CodecError> {
    let mut dec = Decoder::new(bytes);
    let id = dec.str()?;
    let time = dec.u64()?;
    dec.finish()?;
    Ok(Clock::new(id, time))
}
