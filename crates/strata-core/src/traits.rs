//! Collaborator traits consumed by the store
//!
//! The store does not decide who may touch a subject, what type an attribute
//! has, or what time it is. Those answers come from the implementations below,
//! injected when the store is built.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::value::TypeHint;

/// Identity of the actor performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorToken {
    pub username: String,
    pub reason: Option<String>,
}

impl ActorToken {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Intent of an operation, as presented to the access gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    Read,
    Write,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::Read => f.write_str("r"),
            AccessMode::Write => f.write_str("w"),
        }
    }
}

/// Pass/fail gate consulted before every store operation.
///
/// Implementations return `StoreError::AccessDenied` to reject.
pub trait AccessGate: Send + Sync {
    fn check_access(
        &self,
        token: Option<&ActorToken>,
        subjects: &[&str],
        mode: AccessMode,
    ) -> StoreResult<()>;
}

/// Gate that admits every operation
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessGate for AllowAll {
    fn check_access(&self, _: Option<&ActorToken>, _: &[&str], _: AccessMode) -> StoreResult<()> {
        Ok(())
    }
}

/// Lookup of the declared type of an attribute
pub trait TypeRegistry: Send + Sync {
    /// Type hint for `predicate`; unregistered predicates are raw bytes.
    fn type_hint(&self, predicate: &str) -> TypeHint;
}

/// HashMap-backed type registry
#[derive(Debug, Clone, Default)]
pub struct AttributeTypes {
    types: HashMap<String, TypeHint>,
}

impl AttributeTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a predicate's type.
    pub fn with(mut self, predicate: impl Into<String>, hint: TypeHint) -> Self {
        self.types.insert(predicate.into(), hint);
        self
    }

    /// Build from `(predicate, type name)` pairs, e.g. `("size", "integer")`.
    pub fn from_names<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            types: pairs
                .into_iter()
                .map(|(predicate, name)| (predicate.to_string(), TypeHint::from_name(name)))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl TypeRegistry for AttributeTypes {
    fn type_hint(&self, predicate: &str) -> TypeHint {
        self.types.get(predicate).copied().unwrap_or_default()
    }
}

/// Source of the current time in microseconds since the Unix epoch
pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}
