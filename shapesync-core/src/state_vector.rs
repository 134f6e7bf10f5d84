//! Per-replica progress summary used to compute minimal resync deltas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::{LogicalClock, ReplicaId, Stamp};
use crate::delta::CodecError;

/// `ReplicaId → highest clock observed from that replica`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector(BTreeMap<ReplicaId, LogicalClock>);

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest clock seen from `replica` (zero if never seen).
    pub fn get(&self, replica: &ReplicaId) -> LogicalClock {
        self.0.get(replica).copied().unwrap_or_default()
    }

    /// Record that a write with `stamp` was observed.
    pub fn observe(&mut self, stamp: &Stamp) {
        let entry = self.0.entry(stamp.replica.clone()).or_default();
        entry.observe(stamp.clock);
    }

    /// Whether a write with `stamp` is already covered by this vector.
    pub fn includes(&self, stamp: &Stamp) -> bool {
        stamp.clock <= self.get(&stamp.replica)
    }

    /// Pointwise maximum.
    pub fn merge(&mut self, other: &StateVector) {
        for (replica, clock) in &other.0 {
            self.0.entry(replica.clone()).or_default().observe(*clock);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, LogicalClock)> {
        self.0.iter().map(|(r, c)| (r, *c))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(sv)
    }
}
