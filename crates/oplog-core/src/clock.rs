//! Logical clocks attached to entries.
//!
//! A clock is only used to linearize the DAG deterministically when reading.
//! Admission never looks at it.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A Lamport-style clock: owner id plus a counter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Id of the identity that produced the entry.
    pub id: String,
    pub time: u64,
}

impl Clock {
    pub fn new(id: impl Into<String>, time: u64) -> Self {
        Clock {
            id: id.into(),
            time,
        }
    }

    /// The clock a writer uses for its next entry after observing `known`.
    pub fn successor(id: impl Into<String>, known: u64) -> Self {
        Clock::new(id, known.saturating_add(1))
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
