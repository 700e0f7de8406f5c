//! Storable values and the encoding layer
//!
//! Values are a closed variant type chosen by the caller. Encoding never needs
//! the attribute's type hint; decoding does, because the stored bytes carry no
//! type information of their own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// A value that can be stored in a cell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Raw bytes, stored as-is
    Bytes(Vec<u8>),
    /// UTF-8 text
    Text(String),
    /// Signed integer, stored as a base-10 string
    Integer(i64),
    /// Unsigned integer, stored as a base-10 string
    Unsigned(u64),
    /// Structured value, stored in its canonical serialization
    Structured(serde_json::Value),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Unsigned(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Self {
        Value::Unsigned(u)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Structured(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bytes(b) => write!(f, "{}", String::from_utf8_lossy(b)),
            Value::Text(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Unsigned(u) => write!(f, "{}", u),
            Value::Structured(v) => write!(f, "{}", v),
        }
    }
}

/// How the bytes of a predicate's cells should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeHint {
    Integer,
    UnsignedInteger,
    String,
    Json,
    /// Raw passthrough; the default for unregistered predicates
    #[default]
    Bytes,
}

impl TypeHint {
    /// Parse a registry type name. Unknown names fall back to raw bytes.
    pub fn from_name(name: &str) -> Self {
        match name {
            "integer" => TypeHint::Integer,
            "unsigned_integer" => TypeHint::UnsignedInteger,
            "string" => TypeHint::String,
            "json" => TypeHint::Json,
            _ => TypeHint::Bytes,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TypeHint::Integer => "integer",
            TypeHint::UnsignedInteger => "unsigned_integer",
            TypeHint::String => "string",
            TypeHint::Json => "json",
            TypeHint::Bytes => "bytes",
        }
    }
}

impl fmt::Display for TypeHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Convert a value to the bytes persisted in a cell
pub fn encode(value: &Value) -> Vec<u8> {
    match value {
        Value::Bytes(b) => b.clone(),
        Value::Text(s) => s.as_bytes().to_vec(),
        Value::Integer(i) => i.to_string().into_bytes(),
        Value::Unsigned(u) => u.to_string().into_bytes(),
        // serde_json::Value serialization is infallible and, with the default
        // map type, key-ordered
        Value::Structured(v) => v.to_string().into_bytes(),
    }
}

/// Interpret stored bytes according to the predicate's type hint
pub fn decode(predicate: &str, hint: TypeHint, bytes: Vec<u8>) -> StoreResult<Value> {
    let fail = |reason: String| StoreError::Decode {
        predicate: predicate.to_string(),
        hint: hint.to_string(),
        reason,
    };

    match hint {
        TypeHint::Integer => {
            let text = std::str::from_utf8(&bytes).map_err(|e| fail(e.to_string()))?;
            text.trim()
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|e| fail(format!("'{}': {}", text, e)))
        }
        TypeHint::UnsignedInteger => {
            let text = std::str::from_utf8(&bytes).map_err(|e| fail(e.to_string()))?;
            text.trim()
                .parse::<u64>()
                .map(Value::Unsigned)
                .map_err(|e| fail(format!("'{}': {}", text, e)))
        }
        TypeHint::String => String::from_utf8(bytes)
            .map(Value::Text)
            .map_err(|e| fail(e.to_string())),
        TypeHint::Json => serde_json::from_slice(&bytes)
            .map(Value::Structured)
            .map_err(|e| fail(e.to_string())),
        TypeHint::Bytes => Ok(Value::Bytes(bytes)),
    }
}
