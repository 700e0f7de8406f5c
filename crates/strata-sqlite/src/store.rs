//! File-per-subject data store
//!
//! [`SqliteDataStore`] is the public face of the backend: it checks access,
//! resolves timestamps, encodes and decodes values, and runs every operation
//! inside one scoped acquisition of the subject's connection.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{
    decode, encode, AccessGate, AccessMode, ActorToken, AllowAll, AttributeTypes, Cell, Clock,
    EscapedFilenames, Limit, StoreConfig, StoreError, StoreResult, StoredCell, SubjectMapping,
    SystemClock, Timestamps, TypeRegistry, Value, MAX_TIMESTAMP,
};
use tracing::{debug, warn};

use crate::cache::ConnectionCache;
use crate::connection::ConnectionGuard;
use crate::transaction::LeaseTransaction;

/// Times an operation reopens a connection that was closed under it
const MAX_REOPEN_ATTEMPTS: usize = 3;

/// One value to write, optionally with its own timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub timestamp: Option<i64>,
}

impl Entry {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn at(value: impl Into<Value>, timestamp: i64) -> Self {
        Self {
            value: value.into(),
            timestamp: Some(timestamp),
        }
    }
}

impl From<Value> for Entry {
    fn from(value: Value) -> Self {
        Entry::new(value)
    }
}

impl From<(Value, i64)> for Entry {
    fn from((value, timestamp): (Value, i64)) -> Self {
        Entry::at(value, timestamp)
    }
}

/// Values to write, grouped by predicate
pub type ValuesByPredicate = BTreeMap<String, Vec<Entry>>;

/// Options for [`SqliteDataStore::multi_set`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOptions {
    /// Default timestamp for entries without one; `None` means now
    pub timestamp: Option<i64>,
    /// Delete existing versions of every written predicate first
    pub replace: bool,
    /// Additional predicates to delete before writing
    pub to_delete: Vec<String>,
}

impl Default for SetOptions {
    fn default() -> Self {
        Self {
            timestamp: None,
            replace: true,
            to_delete: Vec::new(),
        }
    }
}

impl SetOptions {
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn replace(mut self, replace: bool) -> Self {
        self.replace = replace;
        self
    }

    pub fn delete(mut self, predicate: impl Into<String>) -> Self {
        self.to_delete.push(predicate.into());
        self
    }
}

/// Builder for [`SqliteDataStore`]; collaborators default to permissive,
/// untyped, one-file-per-subject, wall-clock implementations.
pub struct StoreBuilder {
    config: StoreConfig,
    gate: Arc<dyn AccessGate>,
    types: Arc<dyn TypeRegistry>,
    mapping: Arc<dyn SubjectMapping>,
    clock: Arc<dyn Clock>,
}

impl StoreBuilder {
    pub fn access_gate(mut self, gate: impl AccessGate + 'static) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    pub fn type_registry(mut self, types: impl TypeRegistry + 'static) -> Self {
        self.types = Arc::new(types);
        self
    }

    pub fn subject_mapping(mut self, mapping: impl SubjectMapping + 'static) -> Self {
        self.mapping = Arc::new(mapping);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> StoreResult<SqliteDataStore> {
        self.config.validate()?;
        let cache = ConnectionCache::new(&self.config, self.mapping)?;
        Ok(SqliteDataStore {
            config: self.config,
            cache,
            gate: self.gate,
            types: self.types,
            clock: self.clock,
        })
    }
}

/// Versioned attribute store with one SQLite file per subject
pub struct SqliteDataStore {
    config: StoreConfig,
    cache: ConnectionCache,
    gate: Arc<dyn AccessGate>,
    types: Arc<dyn TypeRegistry>,
    clock: Arc<dyn Clock>,
}

impl SqliteDataStore {
    pub fn builder(config: StoreConfig) -> StoreBuilder {
        StoreBuilder {
            config,
            gate: Arc::new(AllowAll),
            types: Arc::new(AttributeTypes::new()),
            mapping: Arc::new(EscapedFilenames),
            clock: Arc::new(SystemClock),
        }
    }

    /// Open a store with default collaborators.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &ConnectionCache {
        &self.cache
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub(crate) fn check_access(
        &self,
        token: Option<&ActorToken>,
        subjects: &[&str],
        mode: AccessMode,
    ) -> StoreResult<()> {
        self.gate.check_access(token, subjects, mode)
    }

    /// Run `f` inside one acquisition of `subject`'s connection.
    ///
    /// Commits when `f` succeeds and rolls back when it fails, so a batch is
    /// applied entirely or not at all. A connection found closed is dropped
    /// from the cache and reopened a bounded number of times.
    pub(crate) fn with_connection<T>(
        &self,
        subject: &str,
        mut f: impl FnMut(&ConnectionGuard<'_>) -> crate::error::Result<T>,
    ) -> StoreResult<T> {
        let mut reopened = 0;
        loop {
            let conn = self.cache.get(subject)?;
            let guard = conn.lock();
            if guard.is_closed() {
                // the guard must go before touching the cache again
                drop(guard);
                if reopened == MAX_REOPEN_ATTEMPTS {
                    return Err(StoreError::Closed(conn.path().display().to_string()));
                }
                reopened += 1;
                debug!("connection for {} was closed, reopening", subject);
                self.cache.discard(subject, &conn);
                continue;
            }

            return match f(&guard) {
                Ok(value) => {
                    guard.finish()?;
                    Ok(value)
                }
                Err(e) => {
                    if let Err(rollback) = guard.abandon() {
                        warn!("rollback on {} failed: {}", subject, rollback);
                    }
                    Err(e.into())
                }
            };
        }
    }

    fn decode_cell(&self, predicate: String, bytes: Vec<u8>, timestamp: i64) -> StoreResult<Cell> {
        let value = decode(&predicate, self.types.type_hint(&predicate), bytes)?;
        Ok(Cell {
            predicate,
            value,
            timestamp,
        })
    }

    /// Write many values to one subject at once.
    ///
    /// With `replace`, every written predicate loses its existing versions
    /// first. Deletes and inserts commit together.
    pub fn multi_set(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        values: &ValuesByPredicate,
        options: SetOptions,
    ) -> StoreResult<()> {
        self.check_access(token, &[subject], AccessMode::Write)?;

        let timestamp = options
            .timestamp
            .unwrap_or_else(|| self.clock.now_micros());
        let mut to_delete = options.to_delete;
        if options.replace {
            to_delete.extend(values.keys().cloned());
        }
        to_delete.sort();
        to_delete.dedup();

        let encoded: Vec<(&str, Vec<u8>, i64)> = values
            .iter()
            .flat_map(|(predicate, entries)| {
                entries.iter().map(move |entry| {
                    (
                        predicate.as_str(),
                        encode(&entry.value),
                        entry.timestamp.unwrap_or(timestamp),
                    )
                })
            })
            .collect();

        self.with_connection(subject, |conn| {
            for predicate in &to_delete {
                conn.delete_attribute(subject, predicate)?;
            }
            for (predicate, bytes, ts) in &encoded {
                conn.insert(subject, predicate, bytes, *ts)?;
            }
            Ok(())
        })
    }

    /// Write a single value.
    pub fn set(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        predicate: &str,
        value: impl Into<Value>,
        timestamp: Option<i64>,
        replace: bool,
    ) -> StoreResult<()> {
        let mut values = ValuesByPredicate::new();
        values.insert(predicate.to_string(), vec![Entry::new(value)]);
        let options = SetOptions {
            timestamp,
            replace,
            to_delete: Vec::new(),
        };
        self.multi_set(token, subject, &values, options)
    }

    /// Remove predicates from a subject.
    ///
    /// Without bounds every version goes; with either bound only versions in
    /// `[start, end]` do, `start` defaulting to 0 and `end` to `i64::MAX`.
    pub fn delete_attributes<S: AsRef<str>>(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        predicates: &[S],
        start: Option<i64>,
        end: Option<i64>,
    ) -> StoreResult<()> {
        self.check_access(token, &[subject], AccessMode::Write)?;

        self.with_connection(subject, |conn| {
            for predicate in predicates {
                let predicate = predicate.as_ref();
                if start.is_none() && end.is_none() {
                    conn.delete_attribute(subject, predicate)?;
                } else {
                    conn.delete_attribute_range(
                        subject,
                        predicate,
                        start.unwrap_or(0),
                        end.unwrap_or(MAX_TIMESTAMP),
                    )?;
                }
            }
            Ok(())
        })
    }

    /// Remove every predicate matching any of `patterns`.
    pub fn delete_attributes_matching<S: AsRef<str>>(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        patterns: &[S],
    ) -> StoreResult<()> {
        self.check_access(token, &[subject], AccessMode::Write)?;

        self.with_connection(subject, |conn| {
            for pattern in patterns {
                conn.delete_attributes_matching(subject, pattern.as_ref())?;
            }
            Ok(())
        })
    }

    /// Remove every cell of a subject.
    pub fn delete_subject(&self, token: Option<&ActorToken>, subject: &str) -> StoreResult<()> {
        self.check_access(token, &[subject], AccessMode::Write)?;
        self.with_connection(subject, |conn| conn.delete_subject(subject).map(|_| ()))
    }

    /// Newest value of one predicate.
    pub fn resolve(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        predicate: &str,
    ) -> StoreResult<Option<(Value, i64)>> {
        self.check_access(token, &[subject], AccessMode::Read)?;

        let newest = self.with_connection(subject, |conn| conn.newest_value(subject, predicate))?;
        match newest {
            Some((bytes, ts)) => {
                let cell = self.decode_cell(predicate.to_string(), bytes, ts)?;
                Ok(Some((cell.value, ts)))
            }
            None => Ok(None),
        }
    }

    /// Cells whose predicate matches any of `patterns`.
    ///
    /// `limit` caps the total across all patterns; each pattern gets what the
    /// previous ones left over.
    pub fn resolve_matching<S: AsRef<str>>(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        patterns: &[S],
        timestamps: Timestamps,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Cell>> {
        self.check_access(token, &[subject], AccessMode::Read)?;
        if Limit::new(limit).is_exhausted() {
            return Ok(Vec::new());
        }

        let rows = self.with_connection(subject, |conn| {
            let mut budget = Limit::new(limit);
            let mut rows = Vec::new();
            for pattern in patterns {
                if budget.is_exhausted() {
                    break;
                }
                let found = match timestamps.bounds() {
                    None => conn.newest_per_matching_predicate(
                        subject,
                        pattern.as_ref(),
                        budget.as_storage_limit(),
                    )?,
                    Some((start, end)) => conn.values_matching_in_range(
                        subject,
                        pattern.as_ref(),
                        start,
                        end,
                        budget.as_storage_limit(),
                    )?,
                };
                budget.consume(found.len());
                rows.extend(found);
            }
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(predicate, bytes, ts)| self.decode_cell(predicate, bytes, ts))
            .collect()
    }

    /// Cells of the given predicates, in predicate order.
    pub fn resolve_multi<S: AsRef<str>>(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        predicates: &[S],
        timestamps: Timestamps,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Cell>> {
        self.check_access(token, &[subject], AccessMode::Read)?;
        if Limit::new(limit).is_exhausted() {
            return Ok(Vec::new());
        }

        let rows = self.with_connection(subject, |conn| {
            let mut budget = Limit::new(limit);
            let mut rows = Vec::new();
            for predicate in predicates {
                if budget.is_exhausted() {
                    break;
                }
                let predicate = predicate.as_ref();
                match timestamps.bounds() {
                    None => {
                        if let Some((bytes, ts)) = conn.newest_value(subject, predicate)? {
                            rows.push((predicate.to_string(), bytes, ts));
                            budget.consume(1);
                        }
                    }
                    Some((start, end)) => {
                        let found = conn.values_in_range(
                            subject,
                            predicate,
                            start,
                            end,
                            budget.as_storage_limit(),
                        )?;
                        budget.consume(found.len());
                        rows.extend(
                            found
                                .into_iter()
                                .map(|(bytes, ts)| (predicate.to_string(), bytes, ts)),
                        );
                    }
                }
            }
            Ok(rows)
        })?;

        rows.into_iter()
            .map(|(predicate, bytes, ts)| self.decode_cell(predicate, bytes, ts))
            .collect()
    }

    /// [`SqliteDataStore::resolve_matching`] over several subjects.
    ///
    /// Subjects keep the caller's order and are omitted when nothing matched.
    /// `limit` is shared by all subjects.
    pub fn multi_resolve_matching<S: AsRef<str>, P: AsRef<str>>(
        &self,
        token: Option<&ActorToken>,
        subjects: &[S],
        patterns: &[P],
        timestamps: Timestamps,
        limit: Option<usize>,
    ) -> StoreResult<Vec<(String, Vec<Cell>)>> {
        let mut budget = Limit::new(limit);
        let mut results = Vec::new();

        for subject in subjects {
            if budget.is_exhausted() {
                break;
            }
            let remaining = limit.map(|_| budget.as_storage_limit());
            let cells = self.resolve_matching(token, subject.as_ref(), patterns, timestamps, remaining)?;
            if !cells.is_empty() {
                budget.consume(cells.len());
                results.push((subject.as_ref().to_string(), cells));
            }
        }
        Ok(results)
    }

    /// Bytes used on disk: the root directory plus every regular file in it.
    pub fn size(&self) -> StoreResult<u64> {
        let root = self.cache.root();
        let meta = match fs::metadata(root) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if !meta.is_dir() {
            return Err(StoreError::StoreCorrupt(format!(
                "expected {} to be a directory",
                root.display()
            )));
        }

        let mut total = meta.len();
        for entry in fs::read_dir(root)? {
            let meta = fs::metadata(entry?.path())?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Every stored cell of every database under the root.
    ///
    /// Read-only and not transactional; meant for operational tooling.
    pub fn dump(&self, token: Option<&ActorToken>) -> StoreResult<Vec<StoredCell>> {
        self.check_access(token, &[], AccessMode::Read)?;

        let root = self.cache.root();
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut destinations = Vec::new();
        for entry in fs::read_dir(root)? {
            let name = entry?.file_name();
            if let Some(destination) = name
                .to_str()
                .and_then(|name| self.cache.mapping().destination_from_filename(name))
            {
                destinations.push(destination);
            }
        }
        destinations.sort();

        let mut cells = Vec::new();
        for destination in destinations {
            let conn = self.cache.get_destination(&destination)?;
            let guard = conn.lock();
            cells.extend(guard.cells()?);
            guard.finish()?;
        }
        Ok(cells)
    }

    /// Take an exclusive lease on `subject`.
    ///
    /// `lease` defaults to the configured transaction timeout.
    pub fn transaction(
        &self,
        token: Option<&ActorToken>,
        subject: &str,
        lease: Option<Duration>,
    ) -> StoreResult<LeaseTransaction<'_>> {
        LeaseTransaction::acquire(self, token, subject, lease)
    }

    /// Flush and close every open connection.
    pub fn close(&self) -> StoreResult<()> {
        Ok(self.cache.close_all()?)
    }
}

impl std::fmt::Debug for SqliteDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDataStore")
            .field("root", &self.config.root_path)
            .field("open_connections", &self.cache.len())
            .finish_non_exhaustive()
    }
}
