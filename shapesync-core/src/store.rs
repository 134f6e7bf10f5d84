//! The replicated shape store.
//!
//! ```text
//!   apply_local_write ──┐                     ┌── snapshot() ──► renderer
//!   delete_shape ───────┤   ┌─────────────┐   │
//!                       ├──►│ ShapeRecord │───┤
//!   merge_remote_delta ─┘   │  fields  ───┼── FieldRegister per FieldKey
//!                           │  tombstone ─┼── FieldRegister<bool>
//!                           └─────────────┘
//! ```
//!
//! Every field is an LWW register ordered by [`Stamp`]. Merging is a
//! register-wise maximum, so the state after any set of writes does not
//! depend on arrival order or duplication.

use std::collections::{BTreeMap, BTreeSet};

use crate::clock::{LogicalClock, ReplicaId, Stamp};
use crate::delta::{CodecError, Delta, FieldWrite, WriteOp};
use crate::register::FieldRegister;
use crate::shape::{FieldKey, FieldValue, Shape, ShapeId};
use crate::snapshot::Snapshot;
use crate::state_vector::StateVector;

/// Register state for one shape id.
#[derive(Debug, Clone, Default)]
struct ShapeRecord {
    fields: BTreeMap<FieldKey, FieldRegister<FieldValue>>,
    tombstone: Option<FieldRegister<bool>>,
}

impl ShapeRecord {
    fn apply(&mut self, op: WriteOp, stamp: Stamp) -> bool {
        match op {
            WriteOp::Field { key, value } => match self.fields.get_mut(&key) {
                Some(register) => register.merge(value, stamp),
                None => {
                    self.fields.insert(key, FieldRegister::new(value, stamp));
                    true
                }
            },
            WriteOp::Tombstone { deleted } => match &mut self.tombstone {
                Some(register) => register.merge(deleted, stamp),
                None => {
                    self.tombstone = Some(FieldRegister::new(deleted, stamp));
                    true
                }
            },
        }
    }

    /// A winning tombstone is one newer than every field write.
    fn is_deleted(&self) -> bool {
        match &self.tombstone {
            Some(t) if *t.value() => self.fields.values().all(|f| f.stamp() < t.stamp()),
            _ => false,
        }
    }

    fn materialize(&self, id: ShapeId) -> Option<Shape> {
        if self.fields.is_empty() || self.is_deleted() {
            return None;
        }
        let mut shape = Shape::new(id);
        for (key, register) in &self.fields {
            shape.set(key.clone(), register.value().clone());
        }
        Some(shape)
    }

    fn writes(&self, id: ShapeId) -> impl Iterator<Item = FieldWrite> + '_ {
        let fields = self.fields.iter().map(move |(key, reg)| {
            FieldWrite::field(id, key.clone(), reg.value().clone(), reg.stamp().clone())
        });
        let tombstone = self
            .tombstone
            .iter()
            .map(move |reg| FieldWrite::tombstone(id, *reg.value(), reg.stamp().clone()));
        fields.chain(tombstone)
    }
}

/// Outcome of merging one delta.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Shapes with at least one register replaced.
    pub changed: BTreeSet<ShapeId>,
    /// Writes that won their register.
    pub applied: usize,
    /// Stale or duplicate writes (silently dropped).
    pub ignored: usize,
}

impl MergeReport {
    pub fn is_noop(&self) -> bool {
        self.applied == 0
    }
}

/// Field-level LWW replicated store of shapes.
#[derive(Debug, Clone)]
pub struct ShapeStore {
    replica: ReplicaId,
    clock: LogicalClock,
    shapes: BTreeMap<ShapeId, ShapeRecord>,
    state_vector: StateVector,
}

impl ShapeStore {
    pub fn new(replica: impl Into<ReplicaId>) -> Self {
        Self {
            replica: replica.into(),
            clock: LogicalClock::ZERO,
            shapes: BTreeMap::new(),
            state_vector: StateVector::new(),
        }
    }

    /// Restore a whole store previously produced by [`encode_full`](Self::encode_full).
    pub fn decode_full(replica: impl Into<ReplicaId>, bytes: &[u8]) -> Result<Self, CodecError> {
        let mut store = Self::new(replica);
        store.merge_full(bytes)?;
        Ok(store)
    }

    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Current Lamport clock (highest clock written or observed).
    pub fn clock(&self) -> LogicalClock {
        self.clock
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.state_vector
    }

    // ─── Local writes ─────────────────────────────────────────────────

    /// Stamp `updates` with the next local clock, merge them, and return the
    /// encoded delta to propagate.
    ///
    /// When the same key appears more than once the last value is kept.
    pub fn apply_local_write<I>(&mut self, shape_id: ShapeId, updates: I) -> Vec<u8>
    where
        I: IntoIterator<Item = (FieldKey, FieldValue)>,
    {
        let updates: BTreeMap<FieldKey, FieldValue> = updates.into_iter().collect();
        let stamp = self.next_stamp();
        let writes: Vec<FieldWrite> = updates
            .into_iter()
            .map(|(key, value)| FieldWrite::field(shape_id, key, value, stamp.clone()))
            .collect();
        self.commit_local(writes)
    }

    /// Write a winning tombstone for `shape_id`.
    pub fn delete_shape(&mut self, shape_id: ShapeId) -> Vec<u8> {
        let stamp = self.next_stamp();
        self.commit_local(vec![FieldWrite::tombstone(shape_id, true, stamp)])
    }

    /// Undo a deletion by writing a newer `false` tombstone.
    pub fn restore_shape(&mut self, shape_id: ShapeId) -> Vec<u8> {
        let stamp = self.next_stamp();
        self.commit_local(vec![FieldWrite::tombstone(shape_id, false, stamp)])
    }

    fn next_stamp(&mut self) -> Stamp {
        Stamp {
            clock: self.clock.tick(),
            replica: self.replica.clone(),
        }
    }

    /// The write is applied locally even if it cannot be encoded; the empty
    /// delta returned then leaves propagation to the next full-state exchange.
    fn commit_local(&mut self, writes: Vec<FieldWrite>) -> Vec<u8> {
        let delta = Delta::new(writes);
        let bytes = delta.encode().unwrap_or_else(|e| {
            log::error!("Local delta of {} could not be encoded: {e}", self.replica);
            Vec::new()
        });
        self.apply_delta(delta);
        bytes
    }

    // ─── Remote writes ────────────────────────────────────────────────

    /// Decode and merge a delta from another replica.
    ///
    /// Malformed bytes are rejected before any write is applied.
    pub fn merge_remote_delta(&mut self, bytes: &[u8]) -> Result<MergeReport, CodecError> {
        let delta = Delta::decode(bytes)?;
        let report = self.apply_delta(delta);
        log::trace!(
            "Merged delta into {}: {} applied, {} ignored",
            self.replica,
            report.applied,
            report.ignored
        );
        Ok(report)
    }

    /// Merge an encoded full store into this one.
    pub fn merge_full(&mut self, bytes: &[u8]) -> Result<MergeReport, CodecError> {
        self.merge_remote_delta(bytes)
    }

    /// Merge an already decoded delta.
    pub fn apply_delta(&mut self, delta: Delta) -> MergeReport {
        let mut report = MergeReport::default();
        for write in delta.writes {
            self.clock.observe(write.stamp.clock);
            self.state_vector.observe(&write.stamp);
            let record = self.shapes.entry(write.shape).or_default();
            if record.apply(write.op, write.stamp) {
                report.applied += 1;
                report.changed.insert(write.shape);
            } else {
                report.ignored += 1;
            }
        }
        report
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    /// Every register as one delta.
    pub fn encode_full(&self) -> Result<Vec<u8>, CodecError> {
        self.collect_delta(|_| true).encode()
    }

    /// Writes a peer holding `remote` has not observed.
    pub fn delta_since(&self, remote: &StateVector) -> Result<Vec<u8>, CodecError> {
        self.collect_delta(|stamp| !remote.includes(stamp)).encode()
    }

    fn collect_delta(&self, keep: impl Fn(&Stamp) -> bool) -> Delta {
        let writes = self
            .shapes
            .iter()
            .flat_map(|(id, record)| record.writes(*id))
            .filter(|w| keep(&w.stamp))
            .collect();
        Delta::new(writes)
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Immutable view of every visible shape.
    pub fn snapshot(&self) -> Snapshot {
        self.shapes
            .iter()
            .filter_map(|(id, record)| record.materialize(*id).map(|shape| (*id, shape)))
            .collect()
    }

    /// Materialize a single shape (`None` if unknown or deleted).
    pub fn shape(&self, id: ShapeId) -> Option<Shape> {
        self.shapes.get(&id).and_then(|record| record.materialize(id))
    }

    /// Whether a tombstone currently hides `id`.
    pub fn is_deleted(&self, id: ShapeId) -> bool {
        self.shapes.get(&id).is_some_and(ShapeRecord::is_deleted)
    }

    /// Stamp of the winning write for one field.
    pub fn field_stamp(&self, id: ShapeId, key: &FieldKey) -> Option<&Stamp> {
        self.shapes.get(&id)?.fields.get(key).map(FieldRegister::stamp)
    }

    /// Number of visible shapes.
    pub fn len(&self) -> usize {
        self.shapes
            .iter()
            .filter(|(_, r)| !r.fields.is_empty() && !r.is_deleted())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stroke() -> FieldKey {
        FieldKey::style("strokeColor")
    }

    fn remote_set(id: ShapeId, key: FieldKey, value: &str, clock: u64, replica: &str) -> Vec<u8> {
        Delta::new(vec![FieldWrite::field(id, key, value, Stamp::new(clock, replica))])
            .encode()
            .unwrap()
    }

    fn remote_delete(id: ShapeId, clock: u64, replica: &str) -> Vec<u8> {
        Delta::new(vec![FieldWrite::tombstone(id, true, Stamp::new(clock, replica))])
            .encode()
            .unwrap()
    }

    fn text(store: &ShapeStore, id: ShapeId, key: &FieldKey) -> Option<String> {
        store
            .shape(id)
            .and_then(|s| s.get(key).and_then(|v| v.as_text().map(str::to_string)))
    }

    #[test]
    fn test_local_write_visible_in_snapshot() {
        let mut store = ShapeStore::new("a");
        let id = ShapeId::new();
        let delta = store
            .apply_local_write(id, [(stroke(), "red".into()), (FieldKey::geometry("x"), 4.0.into())]);

        assert!(!delta.is_empty());
        assert_eq!(store.clock().get(), 1);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap.get(&id).unwrap().field_count(), 2);
    }

    #[test]
    fn test_local_delta_replicates() {
        let mut a = ShapeStore::new("a");
        let mut b = ShapeStore::new("b");
        let id = ShapeId::new();
        let delta = a.apply_local_write(id, [(stroke(), "red".into())]);

        let report = b.merge_remote_delta(&delta).unwrap();
        assert_eq!(report.applied, 1);
        assert!(report.changed.contains(&id));
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_local_write_after_merge_wins() {
        let mut a = ShapeStore::new("a");
        let id = ShapeId::new();
        a.merge_remote_delta(&remote_set(id, stroke(), "blue", 40, "z")).unwrap();
        assert_eq!(a.clock().get(), 40);

        a.apply_local_write(id, [(stroke(), "red".into())]);
        assert_eq!(text(&a, id, &stroke()).as_deref(), Some("red"));
        assert_eq!(a.field_stamp(id, &stroke()), Some(&Stamp::new(41, "a")));
    }

    #[test]
    fn test_duplicate_keys_keep_last() {
        let mut a = ShapeStore::new("a");
        let id = ShapeId::new();
        a.apply_local_write(id, [(stroke(), "red".into()), (stroke(), "green".into())]);
        assert_eq!(text(&a, id, &stroke()).as_deref(), Some("green"));
    }

    #[test]
    fn test_scenario_a_higher_clock_wins() {
        let id = ShapeId::from_u128(1);
        let red = remote_set(id, stroke(), "red", 5, "a");
        let blue = remote_set(id, stroke(), "blue", 6, "b");

        let mut left = ShapeStore::new("x");
        left.merge_remote_delta(&red).unwrap();
        left.merge_remote_delta(&blue).unwrap();

        let mut right = ShapeStore::new("y");
        right.merge_remote_delta(&blue).unwrap();
        right.merge_remote_delta(&red).unwrap();

        assert_eq!(text(&left, id, &stroke()).as_deref(), Some("blue"));
        assert_eq!(left.snapshot(), right.snapshot());
    }

    #[test]
    fn test_scenario_b_tie_broken_by_replica() {
        let id = ShapeId::from_u128(1);
        let from_a = remote_set(id, stroke(), "red", 6, "a");
        let from_b = remote_set(id, stroke(), "blue", 6, "b");

        let mut left = ShapeStore::new("x");
        left.merge_remote_delta(&from_a).unwrap();
        left.merge_remote_delta(&from_b).unwrap();

        let mut right = ShapeStore::new("y");
        right.merge_remote_delta(&from_b).unwrap();
        right.merge_remote_delta(&from_a).unwrap();

        assert_eq!(text(&left, id, &stroke()).as_deref(), Some("blue"));
        assert_eq!(text(&right, id, &stroke()).as_deref(), Some("blue"));
    }

    #[test]
    fn test_scenario_c_later_delete_wins() {
        let id = ShapeId::from_u128(1);
        let create = remote_set(id, FieldKey::geometry("x"), "0", 1, "a");
        let delete = remote_delete(id, 7, "a");
        let update = remote_set(id, stroke(), "blue", 6, "b");

        for order in [[&create, &delete, &update], [&create, &update, &delete], [&update, &delete, &create]] {
            let mut store = ShapeStore::new("x");
            for bytes in order {
                store.merge_remote_delta(bytes).unwrap();
            }
            assert!(store.snapshot().get(&id).is_none());
            assert!(store.is_deleted(id));
        }
    }

    #[test]
    fn test_later_update_beats_earlier_delete() {
        let id = ShapeId::from_u128(1);
        let mut store = ShapeStore::new("x");
        store.merge_remote_delta(&remote_set(id, FieldKey::geometry("x"), "0", 1, "a")).unwrap();
        store.merge_remote_delta(&remote_set(id, stroke(), "blue", 8, "b")).unwrap();
        store.merge_remote_delta(&remote_delete(id, 7, "a")).unwrap();

        let shape = store.shape(id).unwrap();
        assert_eq!(shape.field_count(), 2);
        assert_eq!(shape.get(&stroke()).and_then(FieldValue::as_text), Some("blue"));
    }

    #[test]
    fn test_delete_then_restore() {
        let mut store = ShapeStore::new("a");
        let id = ShapeId::new();
        store.apply_local_write(id, [(stroke(), "red".into())]);
        store.delete_shape(id);
        assert!(store.is_empty());

        store.restore_shape(id);
        assert_eq!(store.len(), 1);
        assert_eq!(text(&store, id, &stroke()).as_deref(), Some("red"));
    }

    #[test]
    fn test_tombstone_without_fields_is_invisible() {
        let id = ShapeId::from_u128(3);
        let mut store = ShapeStore::new("x");
        store.merge_remote_delta(&remote_delete(id, 2, "a")).unwrap();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_concurrent_create_same_id_yields_hybrid() {
        let id = ShapeId::from_u128(9);
        let mut a = ShapeStore::new("a");
        let mut b = ShapeStore::new("b");

        // a writes twice so its second write carries clock 2.
        a.apply_local_write(id, [(FieldKey::geometry("x"), 1.0.into()), (stroke(), "red".into())]);
        let a_delta = a.apply_local_write(id, [(FieldKey::geometry("x"), 10.0.into())]);
        let a_first = a.delta_since(&StateVector::new()).unwrap();

        let b_delta = b
            .apply_local_write(id, [(FieldKey::geometry("x"), 2.0.into()), (stroke(), "blue".into()), (FieldKey::metadata("kind"), "ellipse".into())]);

        a.merge_remote_delta(&b_delta).unwrap();
        b.merge_remote_delta(&a_first).unwrap();
        b.merge_remote_delta(&a_delta).unwrap();

        assert_eq!(a.snapshot(), b.snapshot());
        let shape = a.shape(id).unwrap();
        // x: a@2 beats b@1; strokeColor: both @1, "b" > "a"; kind only written by b.
        assert_eq!(shape.get(&FieldKey::geometry("x")).and_then(FieldValue::as_number), Some(10.0));
        assert_eq!(shape.get(&stroke()).and_then(FieldValue::as_text), Some("blue"));
        assert_eq!(shape.get(&FieldKey::metadata("kind")).and_then(FieldValue::as_text), Some("ellipse"));
    }

    #[test]
    fn test_idempotent_merge() {
        let id = ShapeId::from_u128(1);
        let bytes = remote_set(id, stroke(), "red", 3, "a");
        let mut store = ShapeStore::new("x");
        let first = store.merge_remote_delta(&bytes).unwrap();
        let before = store.snapshot();
        let second = store.merge_remote_delta(&bytes).unwrap();

        assert_eq!(first.applied, 1);
        assert!(second.is_noop());
        assert_eq!(second.ignored, 1);
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_malformed_delta_leaves_state_untouched() {
        let id = ShapeId::from_u128(1);
        let mut store = ShapeStore::new("x");
        store.merge_remote_delta(&remote_set(id, stroke(), "red", 3, "a")).unwrap();
        let before = store.snapshot();
        let clock = store.clock();

        let mut bad = remote_set(id, stroke(), "blue", 9, "b");
        bad.truncate(bad.len() - 2);
        assert!(store.merge_remote_delta(&bad).is_err());
        assert!(store.merge_remote_delta(&[]).is_err());
        assert!(store.merge_remote_delta(&[0xde, 0xad, 0xbe, 0xef]).is_err());

        assert_eq!(store.snapshot(), before);
        assert_eq!(store.clock(), clock);
    }

    #[test]
    fn test_full_roundtrip() {
        let mut store = ShapeStore::new("a");
        let keep = ShapeId::new();
        let gone = ShapeId::new();
        store.apply_local_write(keep, [(stroke(), "red".into()), (FieldKey::geometry("w"), 3.0.into())]);
        store.apply_local_write(gone, [(stroke(), "blue".into())]);
        store.delete_shape(gone);

        let bytes = store.encode_full().unwrap();
        let restored = ShapeStore::decode_full("b", &bytes).unwrap();

        assert_eq!(restored.snapshot(), store.snapshot());
        assert!(restored.is_deleted(gone));
        assert_eq!(restored.clock(), store.clock());
        assert_eq!(restored.state_vector(), store.state_vector());
    }

    #[test]
    fn test_delta_since_sends_only_missing() {
        let mut a = ShapeStore::new("a");
        let mut b = ShapeStore::new("b");
        let id = ShapeId::new();
        let first = a.apply_local_write(id, [(stroke(), "red".into())]);
        b.merge_remote_delta(&first).unwrap();
        a.apply_local_write(id, [(FieldKey::geometry("x"), 1.0.into())]);

        let missing = Delta::decode(&a.delta_since(b.state_vector()).unwrap()).unwrap();
        assert_eq!(missing.len(), 1);
        assert_eq!(missing.writes[0].stamp, Stamp::new(2, "a"));

        b.apply_delta(missing);
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_scenario_d_restore_then_merge() {
        let id = ShapeId::from_u128(5);
        let mut writer = ShapeStore::new("a");
        for i in 0..4 {
            writer.apply_local_write(id, [(FieldKey::geometry("x"), (i as f64).into())]);
        }
        assert_eq!(writer.clock().get(), 4);
        let persisted = writer.encode_full().unwrap();
        writer.apply_local_write(id, [(FieldKey::geometry("y"), 1.0.into())]);
        let late = writer.apply_local_write(id, [(stroke(), "blue".into())]);
        assert_eq!(writer.clock().get(), 6);
        let mid = Delta::decode(&writer.delta_since(&{
            let mut sv = StateVector::new();
            sv.observe(&Stamp::new(4, "a"));
            sv
        }).unwrap()).unwrap();

        let mut restored = ShapeStore::decode_full("r", &persisted).unwrap();
        restored.apply_delta(mid);
        restored.merge_remote_delta(&late).unwrap();

        let mut direct = ShapeStore::new("d");
        direct.merge_full(&writer.encode_full().unwrap()).unwrap();

        assert_eq!(restored.snapshot(), direct.snapshot());
        assert_eq!(restored.snapshot(), writer.snapshot());
    }

    #[test]
    fn test_rewound_replica_converges_after_full_exchange() {
        let id = ShapeId::from_u128(9);
        let mut peer = ShapeStore::new("b");

        // Edit reached the peer, then the session restarted without it.
        let mut first = ShapeStore::new("a");
        peer.merge_remote_delta(&first.apply_local_write(id, [(stroke(), "red".into())]))
            .unwrap();
        let mut second = ShapeStore::new("a");
        let reissued = second.apply_local_write(id, [(stroke(), "green".into())]);
        assert_eq!(second.field_stamp(id, &stroke()), first.field_stamp(id, &stroke()));

        peer.merge_remote_delta(&reissued).unwrap();
        second.merge_full(&peer.encode_full().unwrap()).unwrap();
        peer.merge_full(&second.encode_full().unwrap()).unwrap();

        assert_eq!(peer.snapshot(), second.snapshot());
        assert_eq!(text(&peer, id, &stroke()).as_deref(), Some("green"));
    }

    #[test]
    fn test_session_replica_keeps_base_order() {
        let a = ReplicaId::new("a").for_session();
        let b = ReplicaId::new("b").for_session();
        assert!(a.as_str().starts_with("a."));
        assert_ne!(a, ReplicaId::new("a").for_session());
        assert!(Stamp::new(1, b) > Stamp::new(1, a));
    }
}
