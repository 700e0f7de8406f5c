//! Core types for the Strata subject store
//!
//! Strata stores versioned attribute cells, `(subject, predicate, timestamp,
//! value)`, with one database file per subject. This crate holds everything
//! that does not touch a database:
//!
//! - [`Value`] and the encoding layer ([`encode`], [`decode`])
//! - Timestamp selection ([`Timestamps`]) and result [`Cell`]s
//! - Collaborator traits: [`AccessGate`], [`TypeRegistry`], [`SubjectMapping`], [`Clock`]
//! - [`StoreConfig`] and [`StoreError`]
//!
//! # Example
//!
//! ```rust
//! use strata_core::{decode, encode, TypeHint, Value};
//!
//! let bytes = encode(&Value::Integer(-5));
//! assert_eq!(bytes, b"-5");
//! assert_eq!(decode("size", TypeHint::Integer, bytes).unwrap(), Value::Integer(-5));
//! ```

pub mod config;
pub mod error;
pub mod mapping;
pub mod query;
pub mod traits;
pub mod value;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use mapping::{EscapedFilenames, PathPrefix, SubjectMapping};
pub use query::{Cell, Limit, StoredCell, Timestamps, MAX_TIMESTAMP};
pub use traits::{
    AccessGate, AccessMode, ActorToken, AllowAll, AttributeTypes, Clock, SystemClock,
    TypeRegistry,
};
pub use value::{decode, encode, TypeHint, Value};
