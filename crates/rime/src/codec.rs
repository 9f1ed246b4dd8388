//! Canonical keys for identifiers and list queries.
//!
//! Every map inside the repository is keyed by the strings produced here, so
//! two ids that differ only in record key order always hit the same slot.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};

use crate::error::CodecError;

/// An entity identifier.
///
/// Record fields are kept in a `BTreeMap`, which is what makes the encoded
/// form independent of construction order. A `None` field is a `null`
/// relationship target and encodes literally as `null`.
#[derive(Debug, Clone, PartialEq)]
pub enum Id {
    Str(String),
    Num(Number),
    Bool(bool),
    Record(BTreeMap<String, Option<Id>>),
}

impl Id {
    /// Build a record id from `(field, id)` pairs.
    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Id)>,
        K: Into<String>,
    {
        Id::Record(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), Some(value)))
                .collect(),
        )
    }

    /// The canonical key of this id.
    pub fn key(&self) -> String {
        encode_id(self)
    }

    /// Convert back into a JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            Id::Str(s) => Value::String(s.clone()),
            Id::Num(n) => Value::Number(n.clone()),
            Id::Bool(b) => Value::Bool(*b),
            Id::Record(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| {
                        (key.clone(), value.as_ref().map_or(Value::Null, Id::to_value))
                    })
                    .collect(),
            ),
        }
    }
}

impl TryFrom<&Value> for Id {
    type Error = CodecError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(s) => Ok(Id::Str(s.clone())),
            Value::Number(n) => Ok(Id::Num(n.clone())),
            Value::Bool(b) => Ok(Id::Bool(*b)),
            Value::Object(map) => {
                let mut fields = BTreeMap::new();
                for (key, field) in map {
                    let field = match field {
                        Value::Null => None,
                        other => Some(Id::try_from(other)?),
                    };
                    fields.insert(key.clone(), field);
                }
                Ok(Id::Record(fields))
            }
            Value::Null | Value::Array(_) => Err(CodecError::InvalidId(value.to_string())),
        }
    }
}

impl TryFrom<Value> for Id {
    type Error = CodecError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Id::try_from(&value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Id::Str(value.to_string())
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::Str(value)
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Num(Number::from(value))
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Num(Number::from(value))
    }
}

impl From<i32> for Id {
    fn from(value: i32) -> Self {
        Id::Num(Number::from(value))
    }
}

impl From<bool> for Id {
    fn from(value: bool) -> Self {
        Id::Bool(value)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&encode_id(self))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Id::try_from(&value).map_err(serde::de::Error::custom)
    }
}

/// Encode an id into its canonical key.
///
/// # Example
///
/// ```
/// use rime::{Id, encode_id};
///
/// let id = Id::record([("foo", Id::from("foo1")), ("bar", Id::from("bar1"))]);
/// assert_eq!(encode_id(&id), r#"{bar:"bar1",foo:"foo1"}"#);
/// assert_eq!(encode_id(&Id::from(3)), "3");
/// ```
pub fn encode_id(id: &Id) -> String {
    let mut out = String::new();
    write_id(id, &mut out);
    out
}

fn write_id(id: &Id, out: &mut String) {
    match id {
        Id::Str(s) => out.push_str(&quote(s)),
        Id::Num(n) => out.push_str(&format_number(n)),
        Id::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Id::Record(fields) => {
            out.push('{');
            for (index, (key, value)) in fields.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                match value {
                    Some(value) => write_id(value, out),
                    None => out.push_str("null"),
                }
            }
            out.push('}');
        }
    }
}

/// Encode a JSON value as an id key, failing outside the id grammar.
pub fn encode_id_value(value: &Value) -> Result<String, CodecError> {
    Id::try_from(value).map(|id| encode_id(&id))
}

/// Encode a list query parameter into its canonical key.
///
/// Object keys are sorted at every depth, so structurally equal parameters
/// always produce the same key.
pub fn encode_query(parameter: &Value) -> String {
    let mut out = String::new();
    write_canonical(parameter, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&quote(key));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Encode an id as a single URL path segment.
///
/// String ids are used as-is, numbers and booleans as text, and record ids
/// fall back to their canonical key. Percent-encoding is left to the URL
/// builder.
pub fn id_path_segment(id: &Id) -> String {
    match id {
        Id::Str(s) => s.clone(),
        Id::Num(n) => format_number(n),
        Id::Bool(b) => b.to_string(),
        Id::Record(_) => encode_id(id),
    }
}

fn quote(s: &str) -> String {
    Value::String(s.to_string()).to_string()
}

/// Integral floats print without a fraction so `1.0` and `1` share a key.
fn format_number(n: &Number) -> String {
    if n.is_f64()
        && let Some(f) = n.as_f64()
        && f.is_finite()
        && f.fract() == 0.0
        && f.abs() < 1e21
    {
        if f == 0.0 {
            return "0".to_string();
        }
        return format!("{f:.0}");
    }
    n.to_string()
}
