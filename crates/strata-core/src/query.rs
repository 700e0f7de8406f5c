//! Timestamp selection and result cells

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Largest timestamp a cell may carry
pub const MAX_TIMESTAMP: i64 = i64::MAX;

/// Which versions of a predicate a resolution returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timestamps {
    /// One cell per predicate: the one with the largest timestamp
    #[default]
    Newest,
    /// Every version
    All,
    /// Every version with `start <= timestamp <= end`
    Range(i64, i64),
}

impl Timestamps {
    /// Select exactly the versions written at `timestamp`.
    pub fn exact(timestamp: i64) -> Self {
        Timestamps::Range(timestamp, timestamp)
    }

    /// Inclusive bounds for range-style selection.
    ///
    /// `Newest` is not a range and has no bounds.
    pub fn bounds(&self) -> Option<(i64, i64)> {
        match *self {
            Timestamps::Newest => None,
            Timestamps::All => Some((0, MAX_TIMESTAMP)),
            Timestamps::Range(start, end) => Some((start, end)),
        }
    }
}

/// One resolved (predicate, value, timestamp) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub predicate: String,
    pub value: Value,
    pub timestamp: i64,
}

impl Cell {
    pub fn new(predicate: impl Into<String>, value: impl Into<Value>, timestamp: i64) -> Self {
        Self {
            predicate: predicate.into(),
            value: value.into(),
            timestamp,
        }
    }
}

/// A raw stored row, as enumerated by diagnostic dumps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCell {
    pub subject: String,
    pub predicate: String,
    pub timestamp: i64,
    pub value: Vec<u8>,
}

/// Remaining result budget.
///
/// `None` means unlimited. Exhausted budgets stop iteration early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit(Option<usize>);

impl Limit {
    pub fn new(limit: Option<usize>) -> Self {
        Self(limit)
    }

    pub fn unlimited() -> Self {
        Self(None)
    }

    pub fn is_exhausted(&self) -> bool {
        self.0 == Some(0)
    }

    /// Budget to hand to the storage layer, where 0 means no cap.
    pub fn as_storage_limit(&self) -> usize {
        self.0.unwrap_or(0)
    }

    pub fn consume(&mut self, n: usize) {
        if let Some(remaining) = self.0.as_mut() {
            *remaining = remaining.saturating_sub(n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds() {
        assert_eq!(Timestamps::Newest.bounds(), None);
        assert_eq!(Timestamps::All.bounds(), Some((0, i64::MAX)));
        assert_eq!(Timestamps::exact(7).bounds(), Some((7, 7)));
    }

    #[test]
    fn test_limit_consumption() {
        let mut limit = Limit::new(Some(3));
        assert_eq!(limit.as_storage_limit(), 3);
        limit.consume(2);
        assert!(!limit.is_exhausted());
        limit.consume(5);
        assert!(limit.is_exhausted());

        let mut unlimited = Limit::unlimited();
        unlimited.consume(1000);
        assert!(!unlimited.is_exhausted());
        assert_eq!(unlimited.as_storage_limit(), 0);
    }
}
