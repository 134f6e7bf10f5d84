//! Replica identity, Lamport clocks and the write ordering key.
//!
//! Every write carries a [`Stamp`]: `(clock, replica)`. Stamps are totally
//! ordered: a higher clock wins, and equal clocks are broken by the
//! lexicographically larger replica id. Because the order is total, every
//! register has exactly one winner no matter in which order writes arrive.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one replica (one editing session on one device).
///
/// Compared lexicographically when two writes carry the same clock.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random replica id (UUID v4, hyphenated).
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// This id with a random per-session suffix (`base.1a2b3c4d`).
    ///
    /// A session that restarts from an older snapshot rewinds its clock; a
    /// fresh suffix keeps it from reissuing stamps its previous run already
    /// sent to peers. Suffixing keeps the base prefix, so ties between
    /// different bases still resolve by base.
    pub fn for_session(&self) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}.{}", self.0, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Per-replica Lamport counter.
///
/// A replica ticks its clock for every local write and fast-forwards it to
/// the highest clock it has observed in remote writes, so its next local
/// write is newer than anything it has seen.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogicalClock(u64);

impl LogicalClock {
    pub const ZERO: LogicalClock = LogicalClock(0);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Advance by one and return the new value.
    pub fn tick(&mut self) -> LogicalClock {
        self.0 += 1;
        *self
    }

    /// Fast-forward to `other` if it is ahead.
    pub fn observe(&mut self, other: LogicalClock) {
        if other.0 > self.0 {
            self.0 = other.0;
        }
    }
}

impl fmt::Display for LogicalClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordering key of a single write.
///
/// Field order matters: the derived `Ord` compares `clock` first and
/// `replica` second.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: LogicalClock,
    pub replica: ReplicaId,
}

impl Stamp {
    pub fn new(clock: u64, replica: impl Into<ReplicaId>) -> Self {
        Self {
            clock: LogicalClock::new(clock),
            replica: replica.into(),
        }
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.replica)
    }
}
