//! Envelope data model.
//!
//! An [`Envelope`] is the unit exchanged over the bus: a mapping from string
//! keys to [`Value`]s plus zero or more opaque binary parts ([`Blob`]).
//!
//! The value union is closed: strings, 64-bit floats, booleans, nested
//! objects and arrays. Every number is an `f64`, so `2` and `2.0` are the
//! same value and survive a round trip unchanged. JSON `null` and
//! non-finite numbers are rejected with [`EnvelopeError::InvalidValueType`].

pub mod codec;

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use codec::{CodecError, EncodedMessage};

/// Errors raised while building an envelope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Invalid value type at '{path}': {reason}")]
    InvalidValueType { path: String, reason: String },
}

impl EnvelopeError {
    fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValueType {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// A value stored in an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Object(BTreeMap<String, Value>),
    Array(Vec<Value>),
}

/// Type tag of a [`Value`], used for self-description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Number => "number",
            ValueKind::Bool => "bool",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Create a number, rejecting NaN and infinities.
    pub fn number(n: f64) -> Result<Self, EnvelopeError> {
        if n.is_finite() {
            Ok(Value::Number(n))
        } else {
            Err(EnvelopeError::invalid("", format!("non-finite number {}", n)))
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Number(_) => ValueKind::Number,
            Value::Bool(_) => ValueKind::Bool,
            Value::Object(_) => ValueKind::Object,
            Value::Array(_) => ValueKind::Array,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Convert from a JSON value. `null` and numbers that do not fit an
    /// `f64` are outside the value union.
    pub fn from_json(value: serde_json::Value) -> Result<Self, EnvelopeError> {
        Self::from_json_at(value, "")
    }

    fn from_json_at(value: serde_json::Value, path: &str) -> Result<Self, EnvelopeError> {
        match value {
            serde_json::Value::Null => Err(EnvelopeError::invalid(path, "null is not supported")),
            serde_json::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_json::Value::String(s) => Ok(Value::String(s)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .filter(|f| f.is_finite())
                .map(Value::Number)
                .ok_or_else(|| EnvelopeError::invalid(path, format!("number {} is not an f64", n))),
            serde_json::Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| Self::from_json_at(item, &format!("{}[{}]", path, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let child = join_path(path, &k);
                    Self::from_json_at(v, &child).map(|v| (k, v))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Object),
        }
    }

    /// Convert into a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
        }
    }

    /// Check that every nested number is finite.
    fn validate(&self, path: &str) -> Result<(), EnvelopeError> {
        match self {
            Value::Number(n) if !n.is_finite() => Err(EnvelopeError::invalid(
                path,
                format!("non-finite number {}", n),
            )),
            Value::Object(map) => map
                .iter()
                .try_for_each(|(k, v)| v.validate(&join_path(path, k))),
            Value::Array(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, v)| v.validate(&format!("{}[{}]", path, i))),
            _ => Ok(()),
        }
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Object(map)
    }
}

/// Non-finite numbers are accepted here and rejected when the envelope is
/// built.
impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = EnvelopeError;

    fn try_from(value: serde_json::Value) -> Result<Self, Self::Error> {
        Value::from_json(value)
    }
}

/// An opaque binary part carried next to the value mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    name: Option<String>,
    data: Bytes,
}

impl Blob {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            name: None,
            data: data.into(),
        }
    }

    pub fn named(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: Some(name.into()),
            data: data.into(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

/// What an envelope carries, used to pick wire content tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// Value mapping only.
    Json,
    /// Binary parts only.
    Blob,
    /// Value mapping plus binary parts.
    JsonBlob,
}

/// Lightweight self-description of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub content_type: ContentType,
    pub fields: BTreeMap<String, ValueKind>,
    pub blob_count: usize,
}

/// Structured message payload with optional binary parts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    data: BTreeMap<String, Value>,
    blobs: Vec<Blob>,
}

impl Envelope {
    /// Build an envelope, validating every value.
    pub fn new(data: BTreeMap<String, Value>, blobs: Vec<Blob>) -> Result<Self, EnvelopeError> {
        for (key, value) in &data {
            value.validate(key)?;
        }
        Ok(Self { data, blobs })
    }

    /// Build an envelope from a JSON object.
    pub fn from_json(value: serde_json::Value, blobs: Vec<Blob>) -> Result<Self, EnvelopeError> {
        match Value::from_json(value)? {
            Value::Object(data) => Ok(Self { data, blobs }),
            other => Err(EnvelopeError::invalid(
                "",
                format!("envelope root must be an object, got {}", other.kind()),
            )),
        }
    }

    pub fn builder() -> EnvelopeBuilder {
        EnvelopeBuilder::default()
    }

    pub fn data(&self) -> &BTreeMap<String, Value> {
        &self.data
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }

    pub fn blob(&self, index: usize) -> Option<&Blob> {
        self.blobs.get(index)
    }

    /// First blob carrying the given name.
    pub fn blob_named(&self, name: &str) -> Option<&Blob> {
        self.blobs.iter().find(|b| b.name() == Some(name))
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.blobs.is_empty()
    }

    pub fn content_type(&self) -> ContentType {
        match (self.data.is_empty(), self.blobs.is_empty()) {
            (false, true) | (true, true) => ContentType::Json,
            (true, false) => ContentType::Blob,
            (false, false) => ContentType::JsonBlob,
        }
    }

    pub fn describe(&self) -> Shape {
        Shape {
            content_type: self.content_type(),
            fields: self
                .data
                .iter()
                .map(|(k, v)| (k.clone(), v.kind()))
                .collect(),
            blob_count: self.blobs.len(),
        }
    }

    /// The value mapping as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.data
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    pub fn into_parts(self) -> (BTreeMap<String, Value>, Vec<Blob>) {
        (self.data, self.blobs)
    }
}

/// Incremental envelope construction.
#[derive(Debug, Default)]
pub struct EnvelopeBuilder {
    data: BTreeMap<String, Value>,
    blobs: Vec<Blob>,
    error: Option<EnvelopeError>,
}

impl EnvelopeBuilder {
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Add a field from a fallible conversion (e.g. a JSON value). The
    /// first failure is reported by [`build`](Self::build).
    pub fn try_field<V>(mut self, key: impl Into<String>, value: V) -> Self
    where
        V: TryInto<Value, Error = EnvelopeError>,
    {
        let key = key.into();
        match value.try_into() {
            Ok(v) => {
                self.data.insert(key, v);
            }
            Err(EnvelopeError::InvalidValueType { reason, .. }) => {
                self.error
                    .get_or_insert(EnvelopeError::InvalidValueType { path: key, reason });
            }
        }
        self
    }

    pub fn blob(mut self, data: impl Into<Bytes>) -> Self {
        self.blobs.push(Blob::new(data));
        self
    }

    pub fn named_blob(mut self, name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.blobs.push(Blob::named(name, data));
        self
    }

    pub fn build(self) -> Result<Envelope, EnvelopeError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Envelope::new(self.data, self.blobs)
    }
}

#[cfg(test)]
mod tests;
