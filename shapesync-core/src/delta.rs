//! Delta codec.
//!
//! Wire format:
//! ```text
//! ┌─────────┬──────────────────────────────────────────┐
//! │ version │ bincode(Delta)                           │
//! │ 1 byte  │ varint count + [FieldWrite; count]       │
//! └─────────┴──────────────────────────────────────────┘
//! ```
//!
//! A delta is opaque outside this crate: transports and persistence only
//! ever move the encoded bytes. A full-store snapshot uses the same format
//! (a delta containing every register).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Stamp;
use crate::shape::{FieldKey, FieldValue, ShapeId};

/// Current delta format version.
pub const FORMAT_VERSION: u8 = 1;

/// Codec errors. A decode failure rejects the whole unit; nothing from it is applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Empty delta payload")]
    Empty,
    #[error("Unsupported delta format version {0}")]
    UnsupportedVersion(u8),
    #[error("Malformed delta: {0}")]
    Malformed(String),
    #[error("Trailing bytes after delta: {0}")]
    TrailingBytes(usize),
}

/// What a single write does to a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Set one field register.
    Field { key: FieldKey, value: FieldValue },
    /// Set the tombstone register (`true` deletes, `false` restores).
    Tombstone { deleted: bool },
}

/// One stamped write against one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub shape: ShapeId,
    pub stamp: Stamp,
    pub op: WriteOp,
}

impl FieldWrite {
    pub fn field(shape: ShapeId, key: FieldKey, value: impl Into<FieldValue>, stamp: Stamp) -> Self {
        Self {
            shape,
            stamp,
            op: WriteOp::Field {
                key,
                value: value.into(),
            },
        }
    }

    pub fn tombstone(shape: ShapeId, deleted: bool, stamp: Stamp) -> Self {
        Self {
            shape,
            stamp,
            op: WriteOp::Tombstone { deleted },
        }
    }
}

/// A batch of writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub writes: Vec<FieldWrite>,
}

impl Delta {
    pub fn new(writes: Vec<FieldWrite>) -> Self {
        Self { writes }
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Serialize to the versioned binary format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![FORMAT_VERSION];
        bincode::serde::encode_into_std_write(self, &mut out, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Deserialize. The whole buffer must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (&version, body) = bytes.split_first().ok_or(CodecError::Empty)?;
        if version != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let (delta, read): (Delta, usize) =
            bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| CodecError::Malformed(e.to_string()))?;
        if read != body.len() {
            return Err(CodecError::TrailingBytes(body.len() - read));
        }
        Ok(delta)
    }
}
