//! Immutable document snapshot for the rendering path.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::shape::{Shape, ShapeId};

/// Read-only `id → shape` mapping.
///
/// Cloning is a reference-count bump, so the coordinator can hand the same
/// snapshot to any number of readers without copying shapes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    shapes: Arc<BTreeMap<ShapeId, Shape>>,
}

impl Snapshot {
    pub fn get(&self, id: &ShapeId) -> Option<&Shape> {
        self.shapes.get(id)
    }

    pub fn contains(&self, id: &ShapeId) -> bool {
        self.shapes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShapeId, &Shape)> {
        self.shapes.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ShapeId> {
        self.shapes.keys()
    }

    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.shapes.values()
    }
}

impl FromIterator<(ShapeId, Shape)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (ShapeId, Shape)>>(iter: I) -> Self {
        Self {
            shapes: Arc::new(iter.into_iter().collect()),
        }
    }
}
