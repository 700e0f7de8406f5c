//! Per-file storage connection
//!
//! A [`SubjectConnection`] owns one SQLite handle for one database file. All
//! access goes through a [`ConnectionGuard`], which holds the connection's
//! reentrant lock. Mutations open an implicit deferred transaction and mark
//! the connection dirty; the outermost guard commits that transaction when it
//! is released, so no mutation outlives the operation that made it.

use std::cell::RefCell;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use strata_core::{StoreError, StoredCell};
use tracing::{debug, error};

use crate::error::Result;
use crate::schema;

/// `(predicate, value, timestamp)` as stored
pub type RawCell = (String, Vec<u8>, i64);

/// SQLite treats a negative LIMIT as "no limit"
fn sql_limit(limit: usize) -> i64 {
    if limit > 0 {
        i64::try_from(limit).unwrap_or(i64::MAX)
    } else {
        -1
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| {
        StoreError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

struct ConnectionState {
    conn: Option<Connection>,
    dirty: bool,
    /// Number of live guards on the owning thread
    depth: usize,
}

impl ConnectionState {
    fn conn(&self, path: &Path) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::Closed(path.display().to_string()).into())
    }

    /// Connection with a write transaction open.
    fn writable(&mut self, path: &Path) -> Result<&Connection> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| StoreError::Closed(path.display().to_string()))?;
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN DEFERRED")?;
        }
        self.dirty = true;
        Ok(conn)
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.as_ref() {
            // Autocommit mode means no transaction is active: nothing to commit.
            if !conn.is_autocommit() {
                conn.execute_batch("COMMIT")?;
            }
        }
        self.dirty = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.as_ref() {
            if !conn.is_autocommit() {
                conn.execute_batch("ROLLBACK")?;
            }
        }
        self.dirty = false;
        Ok(())
    }
}

/// One open database file
pub struct SubjectConnection {
    path: PathBuf,
    state: ReentrantMutex<RefCell<ConnectionState>>,
}

impl SubjectConnection {
    /// Open an existing database file.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        schema::configure(&conn, busy_timeout)?;
        debug!("opened {}", path.display());

        Ok(Self {
            path,
            state: ReentrantMutex::new(RefCell::new(ConnectionState {
                conn: Some(conn),
                dirty: false,
                depth: 0,
            })),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enter the connection's critical section.
    ///
    /// Re-entrant: a thread that already holds a guard may take another.
    /// Only the outermost guard commits on release.
    pub fn lock(&self) -> ConnectionGuard<'_> {
        let state = self.state.lock();
        state.borrow_mut().depth += 1;
        ConnectionGuard {
            path: &self.path,
            state,
            released: false,
        }
    }

    /// Commit pending mutations. Safe to call when nothing is pending.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let mut state = state.borrow_mut();
        state.flush()
    }

    /// Discard pending mutations.
    pub fn rollback(&self) -> Result<()> {
        let state = self.state.lock();
        let mut state = state.borrow_mut();
        state.rollback()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().borrow().conn.is_none()
    }

    /// Flush if dirty and release the file handle.
    ///
    /// The handle is released even when the flush fails; the flush error is
    /// reported afterwards and the unflushed mutations are lost. Every later
    /// operation on this connection fails with [`StoreError::Closed`].
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let state = self.state.lock();
        let mut state = state.borrow_mut();
        let flushed = if state.dirty { state.flush() } else { Ok(()) };
        state.dirty = false;

        let closed: Result<()> = match state.conn.take() {
            // a handle that refuses to close is finalized by its drop
            Some(conn) => conn.close().map_err(|(_, e)| e.into()),
            None => Ok(()),
        };
        debug!("closed {}", self.path.display());
        flushed.and(closed)
    }
}

impl fmt::Debug for SubjectConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

enum Release {
    Commit,
    Rollback,
}

/// Scoped access to a [`SubjectConnection`].
///
/// Dropping the outermost guard commits pending mutations, or rolls them back
/// when the thread is panicking. Use [`ConnectionGuard::finish`] to see commit
/// errors and [`ConnectionGuard::abandon`] to discard a failed batch.
pub struct ConnectionGuard<'a> {
    path: &'a Path,
    state: ReentrantMutexGuard<'a, RefCell<ConnectionState>>,
    released: bool,
}

impl ConnectionGuard<'_> {
    /// Release the guard, committing if it is the outermost one.
    pub fn finish(mut self) -> Result<()> {
        self.release(Release::Commit)
    }

    /// Release the guard, rolling back if it is the outermost one.
    pub fn abandon(mut self) -> Result<()> {
        self.release(Release::Rollback)
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().conn.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }

    fn release(&mut self, how: Release) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut state = self.state.borrow_mut();
        state.depth -= 1;
        if state.depth > 0 || !state.dirty {
            return Ok(());
        }
        match how {
            Release::Commit => state.flush(),
            Release::Rollback => state.rollback(),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let state = self.state.borrow();
        let conn = state.conn(self.path)?;
        Ok(f(conn)?)
    }

    fn write<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut state = self.state.borrow_mut();
        let conn = state.writable(self.path)?;
        Ok(f(conn)?)
    }

    /// Distinct predicates of `subject` matching `pattern`, in name order.
    fn matching_predicates(&self, subject: &str, pattern: &Regex) -> Result<Vec<String>> {
        let predicates = self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT predicate FROM tbl WHERE subject = ? ORDER BY predicate",
            )?;
            let rows = stmt.query_map([subject], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()
        })?;
        Ok(predicates
            .into_iter()
            .filter(|p| pattern.is_match(p))
            .collect())
    }

    /// Append one cell.
    pub fn insert(&self, subject: &str, predicate: &str, value: &[u8], timestamp: i64) -> Result<()> {
        self.write(|conn| {
            conn.prepare_cached("INSERT INTO tbl (subject, predicate, timestamp, value) VALUES (?, ?, ?, ?)")?
                .execute(params![subject, predicate, timestamp, value])
        })?;
        Ok(())
    }

    /// Remove every version of a predicate. Returns the number of cells removed.
    pub fn delete_attribute(&self, subject: &str, predicate: &str) -> Result<usize> {
        self.write(|conn| {
            conn.prepare_cached("DELETE FROM tbl WHERE subject = ? AND predicate = ?")?
                .execute(params![subject, predicate])
        })
    }

    /// Remove the versions of a predicate with `start <= timestamp <= end`.
    pub fn delete_attribute_range(
        &self,
        subject: &str,
        predicate: &str,
        start: i64,
        end: i64,
    ) -> Result<usize> {
        self.write(|conn| {
            conn.prepare_cached(
                "DELETE FROM tbl WHERE subject = ? AND predicate = ?
                 AND timestamp >= ? AND timestamp <= ?",
            )?
            .execute(params![subject, predicate, start, end])
        })
    }

    /// Remove every cell whose predicate matches `pattern` anywhere.
    pub fn delete_attributes_matching(&self, subject: &str, pattern: &str) -> Result<usize> {
        let regex = compile(pattern)?;
        let mut removed = 0;
        for predicate in self.matching_predicates(subject, &regex)? {
            removed += self.delete_attribute(subject, &predicate)?;
        }
        Ok(removed)
    }

    /// Remove every cell of `subject`.
    pub fn delete_subject(&self, subject: &str) -> Result<usize> {
        self.write(|conn| {
            conn.prepare_cached("DELETE FROM tbl WHERE subject = ?")?
                .execute([subject])
        })
    }

    /// Newest `(value, timestamp)` of a predicate.
    pub fn newest_value(&self, subject: &str, predicate: &str) -> Result<Option<(Vec<u8>, i64)>> {
        self.read(|conn| {
            conn.prepare_cached(
                "SELECT value, timestamp FROM tbl
                 WHERE subject = ? AND predicate = ?
                 ORDER BY timestamp DESC
                 LIMIT 1",
            )?
            .query_row(params![subject, predicate], |row| {
                Ok((row.get::<_, Option<Vec<u8>>>(0)?.unwrap_or_default(), row.get(1)?))
            })
            .optional()
        })
    }

    /// Newest cell of every predicate matching `pattern`, in predicate order.
    ///
    /// At most `limit` rows when `limit > 0`.
    pub fn newest_per_matching_predicate(
        &self,
        subject: &str,
        pattern: &str,
        limit: usize,
    ) -> Result<Vec<RawCell>> {
        let regex = compile(pattern)?;
        // SQLite fills bare columns of a MAX() aggregate from the row holding the max
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT predicate, MAX(timestamp), value FROM tbl
                 WHERE subject = ?
                 GROUP BY predicate
                 ORDER BY predicate",
            )?;
            let rows = stmt.query_map([subject], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(2)?.unwrap_or_default(),
                    row.get::<_, i64>(1)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<RawCell>>>()
        })?;

        let matching = rows.into_iter().filter(|(p, _, _)| regex.is_match(p));
        Ok(if limit > 0 {
            matching.take(limit).collect()
        } else {
            matching.collect()
        })
    }

    /// Versions of a predicate with `start <= timestamp <= end`, oldest first.
    pub fn values_in_range(
        &self,
        subject: &str,
        predicate: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, i64)>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT value, timestamp FROM tbl
                 WHERE subject = ? AND predicate = ?
                   AND timestamp >= ? AND timestamp <= ?
                 ORDER BY timestamp
                 LIMIT ?",
            )?;
            let rows = stmt.query_map(
                params![subject, predicate, start, end, sql_limit(limit)],
                |row| Ok((row.get::<_, Option<Vec<u8>>>(0)?.unwrap_or_default(), row.get(1)?)),
            )?;
            rows.collect()
        })
    }

    /// Every cell in range whose predicate matches `pattern`, oldest first.
    pub fn values_matching_in_range(
        &self,
        subject: &str,
        pattern: &str,
        start: i64,
        end: i64,
        limit: usize,
    ) -> Result<Vec<RawCell>> {
        let regex = compile(pattern)?;
        let rows = self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT predicate, value, timestamp FROM tbl
                 WHERE subject = ? AND timestamp >= ? AND timestamp <= ?
                 ORDER BY timestamp",
            )?;
            let rows = stmt.query_map(params![subject, start, end], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?.unwrap_or_default(),
                    row.get::<_, i64>(2)?,
                ))
            })?;
            rows.collect::<rusqlite::Result<Vec<RawCell>>>()
        })?;

        let matching = rows.into_iter().filter(|(p, _, _)| regex.is_match(p));
        Ok(if limit > 0 {
            matching.take(limit).collect()
        } else {
            matching.collect()
        })
    }

    /// Current lease on `subject` as `(expires, token)`.
    pub fn get_lock(&self, subject: &str) -> Result<Option<(i64, i64)>> {
        self.read(|conn| {
            conn.prepare_cached("SELECT expires, token FROM lock WHERE subject = ?")?
                .query_row([subject], |row| Ok((row.get(0)?, row.get(1)?)))
                .optional()
        })
    }

    pub fn set_lock(&self, subject: &str, expires: i64, token: i64) -> Result<()> {
        self.write(|conn| {
            conn.prepare_cached("INSERT OR REPLACE INTO lock (subject, expires, token) VALUES (?, ?, ?)")?
                .execute(params![subject, expires, token])
        })?;
        Ok(())
    }

    pub fn remove_lock(&self, subject: &str) -> Result<()> {
        self.write(|conn| {
            conn.prepare_cached("DELETE FROM lock WHERE subject = ?")?
                .execute([subject])
        })?;
        Ok(())
    }

    /// Every stored cell in the file, for diagnostics.
    pub fn cells(&self) -> Result<Vec<StoredCell>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT subject, predicate, timestamp, value FROM tbl
                 ORDER BY subject, predicate, timestamp",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(StoredCell {
                    subject: row.get(0)?,
                    predicate: row.get(1)?,
                    timestamp: row.get(2)?,
                    value: row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default(),
                })
            })?;
            rows.collect()
        })
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        let how = if std::thread::panicking() {
            Release::Rollback
        } else {
            Release::Commit
        };
        if let Err(e) = self.release(how) {
            error!("failed to flush {} on release: {}", self.path.display(), e);
        }
    }
}
