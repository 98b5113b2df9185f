//! Replicated state records and the field equality rule
//!
//! Records are open field maps keyed by name. Values are typed through
//! [`FieldValue`] so nothing outside the wire layer deals in raw JSON.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a player or entity record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for RecordId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A single field value inside a record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
    Record(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, FieldValue>> {
        match self {
            Self::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Build a record value from `(key, value)` pairs
    pub fn record<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self::Record(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        field_equals(self, other)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<f32> for FieldValue {
    fn from(v: f32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Vec<T>> for FieldValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<const N: usize> From<[f64; N]> for FieldValue {
    fn from(v: [f64; N]) -> Self {
        Self::List(v.iter().map(|n| Self::Number(*n)).collect())
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Equality used by the delta codec and the state inspector.
///
/// Primitives compare by value (NaN never equals anything), lists compare
/// element-wise in order, records require identical key sets and equal values.
pub fn field_equals(a: &FieldValue, b: &FieldValue) -> bool {
    match (a, b) {
        (FieldValue::Null, FieldValue::Null) => true,
        (FieldValue::Bool(x), FieldValue::Bool(y)) => x == y,
        (FieldValue::Number(x), FieldValue::Number(y)) => x == y,
        (FieldValue::Text(x), FieldValue::Text(y)) => x == y,
        (FieldValue::List(xs), FieldValue::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| field_equals(x, y))
        }
        (FieldValue::Record(xs), FieldValue::Record(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| field_equals(x, y)))
        }
        _ => false,
    }
}

/// Field name holding a record's position vector
pub const POSITION_FIELD: &str = "position";

/// Player or entity state at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub id: RecordId,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl StateRecord {
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        // `id` lives outside the field map so it survives flattening
        if key == "id" {
            return;
        }
        self.fields.insert(key, value.into());
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<FieldValue> {
        self.fields.remove(key)
    }

    /// Numeric vector the wire format would quantize.
    ///
    /// Uses the position list when present, otherwise every numeric field
    /// (and numeric list element) in key order.
    pub fn encoded_vector(&self) -> Vec<f64> {
        if let Some(position) = self.get(POSITION_FIELD).and_then(FieldValue::as_list) {
            return position.iter().filter_map(FieldValue::as_f64).collect();
        }

        let mut out = Vec::new();
        for value in self.fields.values() {
            match value {
                FieldValue::Number(n) => out.push(*n),
                FieldValue::List(items) => out.extend(items.iter().filter_map(FieldValue::as_f64)),
                _ => {}
            }
        }
        out
    }
}

/// Full authoritative world state at one tick
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u64,
    pub players: Vec<StateRecord>,
    pub entities: Vec<StateRecord>,
}

impl Snapshot {
    pub fn new(tick: u64) -> Self {
        Self {
            tick,
            players: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Serialized size in bytes, as it would go out on the wire
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}
