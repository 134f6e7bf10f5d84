//! # shapesync-core: replicated shape store
//!
//! The data half of shapesync: a state-based CRDT holding every shape as a
//! set of field-level last-writer-wins registers.
//!
//! ## Modules
//!
//! - [`clock`]: `ReplicaId`, Lamport `LogicalClock`, `Stamp` ordering key
//! - [`register`]: `FieldRegister` (LWW register)
//! - [`shape`]: `ShapeId`, `FieldKey`, `FieldValue`, materialized `Shape`
//! - [`state_vector`]: per-replica progress summary
//! - [`delta`]: versioned binary delta codec
//! - [`store`]: `ShapeStore`: local writes, remote merge, snapshots
//! - [`snapshot`]: immutable view handed to renderers
//!
//! ## Guarantees
//!
//! Merge is commutative, associative and idempotent: the visible state is a
//! function of the *set* of writes applied, never of their order or
//! multiplicity.

pub mod clock;
pub mod delta;
pub mod register;
pub mod shape;
pub mod snapshot;
pub mod state_vector;
pub mod store;

pub use clock::{LogicalClock, ReplicaId, Stamp};
pub use delta::{CodecError, Delta, FieldWrite, WriteOp, FORMAT_VERSION};
pub use register::{FieldRegister, ValueOrder};
pub use shape::{FieldGroup, FieldKey, FieldValue, Shape, ShapeId};
pub use snapshot::Snapshot;
pub use state_vector::StateVector;
pub use store::{MergeReport, ShapeStore};
