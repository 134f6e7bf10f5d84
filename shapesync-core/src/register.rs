//! Last-writer-wins register.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::clock::Stamp;

/// Deterministic order between two values written under the same stamp.
///
/// A stamp names exactly one write as long as a replica id is never reused
/// with a rewound clock. When that is violated, every replica still has to
/// pick the same value, so equal stamps fall back to this order.
pub trait ValueOrder {
    fn value_cmp(&self, other: &Self) -> Ordering;
}

impl ValueOrder for bool {
    fn value_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl ValueOrder for &str {
    fn value_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl ValueOrder for String {
    fn value_cmp(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

/// A value paired with the stamp of the write that produced it.
///
/// `merge` replaces the value for a greater stamp, or for an equal stamp
/// carrying a greater value. Re-applying the same write (or an older one) is
/// a no-op, and the winner never depends on arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRegister<T> {
    value: T,
    stamp: Stamp,
}

impl<T> FieldRegister<T> {
    pub fn new(value: T, stamp: Stamp) -> Self {
        Self { value, stamp }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn stamp(&self) -> &Stamp {
        &self.stamp
    }
}

impl<T: ValueOrder> FieldRegister<T> {
    /// Whether `value` written at `stamp` would replace the current value.
    pub fn would_accept(&self, value: &T, stamp: &Stamp) -> bool {
        match stamp.cmp(&self.stamp) {
            Ordering::Greater => true,
            Ordering::Equal => value.value_cmp(&self.value) == Ordering::Greater,
            Ordering::Less => false,
        }
    }

    /// Offer a write. Returns `true` if it won.
    pub fn merge(&mut self, value: T, stamp: Stamp) -> bool {
        if !self.would_accept(&value, &stamp) {
            return false;
        }
        self.value = value;
        self.stamp = stamp;
        true
    }
}
