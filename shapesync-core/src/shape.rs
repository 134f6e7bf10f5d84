//! Shape model: ids, field keys and field values.
//!
//! A shape is a fixed set of field groups (`geometry`, `style`, `metadata`),
//! each a map of named values. Every `(group, name)` pair is versioned on its
//! own, so two replicas editing different fields of one shape never conflict.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::register::ValueOrder;

/// Globally unique shape identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShapeId(pub Uuid);

impl ShapeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for ShapeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The field groups every shape carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldGroup {
    Geometry,
    Style,
    Metadata,
}

impl FieldGroup {
    pub const ALL: [FieldGroup; 3] = [FieldGroup::Geometry, FieldGroup::Style, FieldGroup::Metadata];

    pub fn as_str(self) -> &'static str {
        match self {
            FieldGroup::Geometry => "geometry",
            FieldGroup::Style => "style",
            FieldGroup::Metadata => "metadata",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        FieldGroup::ALL.into_iter().find(|g| g.as_str() == s)
    }
}

/// Address of one independently versioned field, printed as `style.strokeColor`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldKey {
    pub group: FieldGroup,
    pub name: String,
}

impl FieldKey {
    pub fn new(group: FieldGroup, name: impl Into<String>) -> Self {
        Self {
            group,
            name: name.into(),
        }
    }

    pub fn geometry(name: impl Into<String>) -> Self {
        Self::new(FieldGroup::Geometry, name)
    }

    pub fn style(name: impl Into<String>) -> Self {
        Self::new(FieldGroup::Style, name)
    }

    pub fn metadata(name: impl Into<String>) -> Self {
        Self::new(FieldGroup::Metadata, name)
    }

    /// Parse a dotted path such as `"geometry.x"`.
    pub fn parse(path: &str) -> Option<Self> {
        let (group, name) = path.split_once('.')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(FieldGroup::parse(group)?, name))
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group.as_str(), self.name)
    }
}

/// Value held by a field register.
///
/// Self-describing on purpose: the binary codec cannot carry schemaless
/// JSON values, so the set of shapes a field may take is closed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    /// Polyline / freehand points in document coordinates.
    Points(Vec<[f64; 2]>),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FieldValue {
    fn kind_rank(&self) -> u8 {
        match self {
            FieldValue::Null => 0,
            FieldValue::Bool(_) => 1,
            FieldValue::Number(_) => 2,
            FieldValue::Text(_) => 3,
            FieldValue::Points(_) => 4,
        }
    }
}

/// Total order: by kind, then by value. Numbers use `f64::total_cmp`, so NaN
/// and signed zeros still compare deterministically.
impl ValueOrder for FieldValue {
    fn value_cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a.cmp(b),
            (FieldValue::Number(a), FieldValue::Number(b)) => a.total_cmp(b),
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Points(a), FieldValue::Points(b)) => a
                .iter()
                .flatten()
                .zip(b.iter().flatten())
                .map(|(x, y)| x.total_cmp(y))
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.len().cmp(&b.len())),
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Vec<[f64; 2]>> for FieldValue {
    fn from(points: Vec<[f64; 2]>) -> Self {
        FieldValue::Points(points)
    }
}

/// A fully materialized shape, as handed to the rendering consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    pub geometry: BTreeMap<String, FieldValue>,
    pub style: BTreeMap<String, FieldValue>,
    pub metadata: BTreeMap<String, FieldValue>,
}

impl Shape {
    pub fn new(id: ShapeId) -> Self {
        Self {
            id,
            geometry: BTreeMap::new(),
            style: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, key: FieldKey, value: impl Into<FieldValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: FieldKey, value: impl Into<FieldValue>) {
        self.group_mut(key.group).insert(key.name, value.into());
    }

    pub fn get(&self, key: &FieldKey) -> Option<&FieldValue> {
        self.group(key.group).get(&key.name)
    }

    pub fn group(&self, group: FieldGroup) -> &BTreeMap<String, FieldValue> {
        match group {
            FieldGroup::Geometry => &self.geometry,
            FieldGroup::Style => &self.style,
            FieldGroup::Metadata => &self.metadata,
        }
    }

    fn group_mut(&mut self, group: FieldGroup) -> &mut BTreeMap<String, FieldValue> {
        match group {
            FieldGroup::Geometry => &mut self.geometry,
            FieldGroup::Style => &mut self.style,
            FieldGroup::Metadata => &mut self.metadata,
        }
    }

    /// All fields as `(key, value)` pairs, groups in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (FieldKey, &FieldValue)> + '_ {
        FieldGroup::ALL.into_iter().flat_map(move |group| {
            self.group(group)
                .iter()
                .map(move |(name, value)| (FieldKey::new(group, name.clone()), value))
        })
    }

    pub fn field_count(&self) -> usize {
        self.geometry.len() + self.style.len() + self.metadata.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_key_display_and_parse() {
        let key = FieldKey::style("strokeColor");
        assert_eq!(key.to_string(), "style.strokeColor");
        assert_eq!(FieldKey::parse("style.strokeColor"), Some(key));
        assert_eq!(FieldKey::parse("geometry.x"), Some(FieldKey::geometry("x")));
    }

    #[test]
    fn test_field_key_parse_rejects_garbage() {
        assert!(FieldKey::parse("strokeColor").is_none());
        assert!(FieldKey::parse("colour.stroke").is_none());
        assert!(FieldKey::parse("style.").is_none());
    }

    #[test]
    fn test_shape_builder_and_fields() {
        let id = ShapeId::from_u128(1);
        let shape = Shape::new(id)
            .with(FieldKey::geometry("x"), 10.0)
            .with(FieldKey::style("strokeColor"), "red")
            .with(FieldKey::metadata("kind"), "rect");

        assert_eq!(shape.field_count(), 3);
        assert_eq!(
            shape.get(&FieldKey::style("strokeColor")).and_then(FieldValue::as_text),
            Some("red")
        );
        let keys: Vec<String> = shape.fields().map(|(k, _)| k.to_string()).collect();
        assert_eq!(keys, vec!["geometry.x", "style.strokeColor", "metadata.kind"]);
    }

    #[test]
    fn test_field_value_accessors() {
        assert_eq!(FieldValue::from(2.5).as_number(), Some(2.5));
        assert_eq!(FieldValue::from(true).as_bool(), Some(true));
        assert_eq!(FieldValue::Null.as_text(), None);
    }

    #[test]
    fn test_field_value_order_is_total() {
        let values = [
            FieldValue::Null,
            FieldValue::from(false),
            FieldValue::from(-1.0),
            FieldValue::from(f64::NAN),
            FieldValue::from("a"),
            FieldValue::from(vec![[0.0, 1.0]]),
            FieldValue::from(vec![[0.0, 1.0], [2.0, 2.0]]),
        ];
        for (i, a) in values.iter().enumerate() {
            assert_eq!(a.value_cmp(a), Ordering::Equal);
            for b in &values[i + 1..] {
                assert_eq!(a.value_cmp(b), Ordering::Less, "{a:?} < {b:?}");
                assert_eq!(b.value_cmp(a), Ordering::Greater);
            }
        }
    }
}
