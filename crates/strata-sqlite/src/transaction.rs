//! Lease-based subject transactions
//!
//! A [`LeaseTransaction`] holds the lock row of one subject. While the lease
//! is unexpired no other transaction can be acquired on that subject; once it
//! expires the next acquirer simply overwrites it. The lease is advisory:
//! plain store writes are never blocked by it.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use strata_core::{AccessMode, ActorToken, Cell, StoreError, StoreResult, Timestamps, Value};
use tracing::warn;

use crate::store::{Entry, SetOptions, SqliteDataStore, ValuesByPredicate};

/// Source of lease tokens; every acquisition attempt in the process gets its own
static NEXT_TOKEN: AtomicI64 = AtomicI64::new(1);

fn duration_micros(duration: Duration) -> i64 {
    i64::try_from(duration.as_micros()).unwrap_or(i64::MAX)
}

/// Where a transaction is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Held,
    Committed,
    Aborted,
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseState::Held => f.write_str("held"),
            LeaseState::Committed => f.write_str("committed"),
            LeaseState::Aborted => f.write_str("aborted"),
        }
    }
}

/// Exclusive, time-bounded lease on one subject with buffered writes.
///
/// Writes made through [`LeaseTransaction::set`] and
/// [`LeaseTransaction::delete_attribute`] are applied on commit. Dropping a
/// held transaction aborts it.
pub struct LeaseTransaction<'a> {
    store: &'a SqliteDataStore,
    actor: Option<ActorToken>,
    subject: String,
    token: i64,
    expires: i64,
    state: LeaseState,
    to_set: ValuesByPredicate,
    to_delete: Vec<String>,
}

impl<'a> LeaseTransaction<'a> {
    pub(crate) fn acquire(
        store: &'a SqliteDataStore,
        actor: Option<&ActorToken>,
        subject: &str,
        lease: Option<Duration>,
    ) -> StoreResult<Self> {
        store.check_access(actor, &[subject], AccessMode::Write)?;

        let lease = lease.unwrap_or_else(|| store.config().transaction_timeout());
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);

        let expires = store.with_connection(subject, |conn| {
            let now = store.clock().now_micros();
            if let Some((locked_until, _)) = conn.get_lock(subject)? {
                if now < locked_until {
                    warn!("subject {} is locked for another {}µs", subject, locked_until - now);
                    return Err(StoreError::Transaction(format!("subject {} is locked", subject)).into());
                }
            }
            let expires = now.saturating_add(duration_micros(lease));
            conn.set_lock(subject, expires, token)?;
            Ok(expires)
        })?;

        // Another process writing the same file may have won the race
        let stored = store.with_connection(subject, |conn| conn.get_lock(subject))?;
        if stored.map(|(_, stored_token)| stored_token) != Some(token) {
            return Err(StoreError::Transaction(format!(
                "unable to lock subject {}",
                subject
            )));
        }

        Ok(Self {
            store,
            actor: actor.cloned(),
            subject: subject.to_string(),
            token,
            expires,
            state: LeaseState::Held,
            to_set: ValuesByPredicate::new(),
            to_delete: Vec::new(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }

    /// Lease expiry in microseconds since the epoch.
    pub fn expires(&self) -> i64 {
        self.expires
    }

    fn ensure_held(&self) -> StoreResult<()> {
        if self.state == LeaseState::Held {
            Ok(())
        } else {
            Err(StoreError::Transaction(format!(
                "transaction on {} is {}",
                self.subject, self.state
            )))
        }
    }

    /// Time left on the lease.
    pub fn check_lease(&self) -> Duration {
        let remaining = self.expires - self.store.clock().now_micros();
        Duration::from_micros(u64::try_from(remaining).unwrap_or(0))
    }

    /// Extend the lease to `duration` from now.
    pub fn update_lease(&mut self, duration: Duration) -> StoreResult<()> {
        self.ensure_held()?;
        let (subject, token) = (self.subject.as_str(), self.token);
        let clock = self.store.clock();
        self.expires = self.store.with_connection(subject, |conn| {
            let expires = clock.now_micros().saturating_add(duration_micros(duration));
            conn.set_lock(subject, expires, token)?;
            Ok(expires)
        })?;
        Ok(())
    }

    /// Buffer a write. With `replace`, existing versions of the predicate are
    /// deleted on commit and earlier buffered writes to it are dropped.
    pub fn set(
        &mut self,
        predicate: &str,
        value: impl Into<Value>,
        timestamp: Option<i64>,
        replace: bool,
    ) -> StoreResult<()> {
        self.ensure_held()?;
        let entry = Entry {
            value: value.into(),
            timestamp,
        };
        let entries = self.to_set.entry(predicate.to_string()).or_default();
        if replace {
            entries.clear();
            self.to_delete.push(predicate.to_string());
        }
        entries.push(entry);
        Ok(())
    }

    /// Buffer the removal of every version of `predicate`.
    pub fn delete_attribute(&mut self, predicate: &str) -> StoreResult<()> {
        self.ensure_held()?;
        self.to_set.remove(predicate);
        self.to_delete.push(predicate.to_string());
        Ok(())
    }

    /// Newest stored value of `predicate`. Buffered writes are not visible.
    pub fn resolve(&self, predicate: &str) -> StoreResult<Option<(Value, i64)>> {
        self.store.resolve(self.actor.as_ref(), &self.subject, predicate)
    }

    pub fn resolve_matching<S: AsRef<str>>(
        &self,
        patterns: &[S],
        timestamps: Timestamps,
    ) -> StoreResult<Vec<Cell>> {
        self.store
            .resolve_matching(self.actor.as_ref(), &self.subject, patterns, timestamps, None)
    }

    /// Apply buffered writes and release the lease.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.ensure_held()?;
        if !self.to_set.is_empty() || !self.to_delete.is_empty() {
            let options = SetOptions {
                timestamp: None,
                replace: false,
                to_delete: std::mem::take(&mut self.to_delete),
            };
            let values = std::mem::take(&mut self.to_set);
            self.store
                .multi_set(self.actor.as_ref(), &self.subject, &values, options)?;
        }
        self.release_lock()?;
        self.state = LeaseState::Committed;
        Ok(())
    }

    /// Release the lease, discarding buffered writes.
    pub fn abort(&mut self) -> StoreResult<()> {
        self.ensure_held()?;
        self.to_set.clear();
        self.to_delete.clear();
        self.release_lock()?;
        self.state = LeaseState::Aborted;
        Ok(())
    }

    /// Remove the lock row if it is still ours; an expired lease may already
    /// belong to someone else.
    fn release_lock(&self) -> StoreResult<()> {
        let (subject, token) = (self.subject.as_str(), self.token);
        self.store.with_connection(subject, |conn| {
            if let Some((_, stored_token)) = conn.get_lock(subject)? {
                if stored_token == token {
                    conn.remove_lock(subject)?;
                }
            }
            Ok(())
        })
    }
}

impl Drop for LeaseTransaction<'_> {
    fn drop(&mut self) {
        if self.state == LeaseState::Held {
            if let Err(e) = self.abort() {
                warn!("failed to release lease on {}: {}", self.subject, e);
            }
        }
    }
}

impl fmt::Debug for LeaseTransaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseTransaction")
            .field("subject", &self.subject)
            .field("token", &self.token)
            .field("expires", &self.expires)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
