//! Neutral value tree for evaluation results.
//!
//! `Runtime.evaluate` results come back as remote objects. Serializable
//! payloads fold into plain values; special numerics (`NaN`, infinities,
//! negative zero, bigints) are normalized; everything that only exists on
//! the browser heap stays behind an opaque [`RemoteObjectRef`].

use serde_json::Value;
use zendriver_cdp::runtime::RemoteObject;

/// Reference to a value left on the browser heap.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteObjectRef {
    pub object_id: String,
    pub class_name: Option<String>,
    pub description: Option<String>,
}

/// The value tree surfaced by `evaluate`.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<RemoteValue>),
    Object(Vec<(String, RemoteValue)>),
    Remote(RemoteObjectRef),
}

impl RemoteValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RemoteValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RemoteValue::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RemoteValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RemoteValue::Null)
    }
}

/// Fold a `RemoteObject` into the neutral tree.
pub fn from_remote_object(object: RemoteObject) -> RemoteValue {
    if let Some(value) = object.value {
        return from_json(value);
    }

    if let Some(unserializable) = object.unserializable_value.as_deref() {
        return from_unserializable(unserializable);
    }

    match object.kind.as_str() {
        "undefined" => RemoteValue::Null,
        _ => match object.object_id {
            Some(object_id) => RemoteValue::Remote(RemoteObjectRef {
                object_id,
                class_name: object.class_name,
                description: object.description,
            }),
            None => RemoteValue::Null,
        },
    }
}

fn from_unserializable(raw: &str) -> RemoteValue {
    match raw {
        "NaN" => RemoteValue::Number(f64::NAN),
        "Infinity" => RemoteValue::Number(f64::INFINITY),
        "-Infinity" => RemoteValue::Number(f64::NEG_INFINITY),
        "-0" => RemoteValue::Number(-0.0),
        other => {
            // Bigints arrive as decimal digits with an `n` suffix.
            if let Some(digits) = other.strip_suffix('n') {
                if let Ok(value) = digits.parse::<f64>() {
                    return RemoteValue::Number(value);
                }
            }
            RemoteValue::String(other.to_string())
        }
    }
}

pub fn from_json(value: Value) -> RemoteValue {
    match value {
        Value::Null => RemoteValue::Null,
        Value::Bool(value) => RemoteValue::Bool(value),
        Value::Number(value) => RemoteValue::Number(value.as_f64().unwrap_or(f64::NAN)),
        Value::String(value) => RemoteValue::String(value),
        Value::Array(items) => RemoteValue::Array(items.into_iter().map(from_json).collect()),
        Value::Object(fields) => RemoteValue::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, from_json(value)))
                .collect(),
        ),
    }
}
