//! Bounded cache of open database connections
//!
//! The cache is the only place connections are created, which keeps at most
//! one open connection per database file in the process. Lock order is
//! cache first, then connection: nothing holding a [`ConnectionGuard`] may
//! call back into the cache.
//!
//! [`ConnectionGuard`]: crate::connection::ConnectionGuard

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use strata_core::{StoreConfig, StoreError, SubjectMapping};
use tracing::{debug, error, info};

use crate::connection::SubjectConnection;
use crate::error::Result;
use crate::schema;

/// Interval between readability checks of a file created by another writer
const READABLE_POLL: Duration = Duration::from_millis(1);

/// LRU cache of [`SubjectConnection`]s keyed by destination
pub struct ConnectionCache {
    root: PathBuf,
    mapping: Arc<dyn SubjectMapping>,
    template: Vec<u8>,
    readable_timeout: Duration,
    busy_timeout: Duration,
    connections: Mutex<LruCache<String, Arc<SubjectConnection>>>,
}

impl ConnectionCache {
    /// Create an empty cache and build the database template.
    ///
    /// The root directory is not created until the first connection is opened.
    pub fn new(config: &StoreConfig, mapping: Arc<dyn SubjectMapping>) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.cache_size)
            .ok_or_else(|| StoreError::Config("cache_size must be positive".to_string()))?;
        let template = schema::build_template()?;
        info!(
            "connection cache for {} (capacity {})",
            config.root_path.display(),
            capacity
        );

        Ok(Self {
            root: config.root_path.clone(),
            mapping,
            template,
            readable_timeout: config.readable_timeout(),
            busy_timeout: config.busy_timeout(),
            connections: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mapping(&self) -> &dyn SubjectMapping {
        self.mapping.as_ref()
    }

    /// Database file holding `destination`.
    pub fn path_for(&self, destination: &str) -> PathBuf {
        self.root.join(self.mapping.filename(destination))
    }

    /// Connection for `subject`, opening (and if needed creating) its file.
    ///
    /// Marks the connection most recently used. May evict and close the least
    /// recently used connection, never the one being returned.
    pub fn get(&self, subject: &str) -> Result<Arc<SubjectConnection>> {
        let destination = self.mapping.destination(subject);
        self.get_destination(&destination)
    }

    /// Connection for an already-resolved destination.
    pub fn get_destination(&self, destination: &str) -> Result<Arc<SubjectConnection>> {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(destination) {
            return Ok(Arc::clone(conn));
        }

        fs::create_dir_all(&self.root)?;
        let path = self.path_for(destination);
        ensure_database_exists(&path, &self.template, self.readable_timeout)?;

        let conn = Arc::new(SubjectConnection::open(&path, self.busy_timeout)?);
        if let Some((evicted, old)) = connections.push(destination.to_string(), Arc::clone(&conn)) {
            debug!("evicting connection for {}", evicted);
            // close releases the handle even when the final flush fails
            if let Err(e) = old.close() {
                error!("failed to flush evicted connection for {}: {}", evicted, e);
            }
        }
        Ok(conn)
    }

    /// Drop `conn` from the cache if it is still the entry for `subject`.
    ///
    /// Returns whether it was removed. The connection itself is left as is.
    pub fn discard(&self, subject: &str, conn: &Arc<SubjectConnection>) -> bool {
        let destination = self.mapping.destination(subject);
        let mut connections = self.connections.lock();
        let cached = connections
            .peek(&destination)
            .map_or(false, |current| Arc::ptr_eq(current, conn));
        if cached {
            connections.pop(&destination);
            debug!("discarded connection for {}", destination);
        }
        cached
    }

    /// Whether a connection for `subject` is open. Does not touch recency.
    pub fn contains(&self, subject: &str) -> bool {
        let destination = self.mapping.destination(subject);
        self.connections.lock().contains(&destination)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.connections.lock().cap().get()
    }

    /// Snapshot of the open connections, most recently used first.
    pub fn connections(&self) -> Vec<Arc<SubjectConnection>> {
        self.connections
            .lock()
            .iter()
            .map(|(_, conn)| Arc::clone(conn))
            .collect()
    }

    /// Flush and close every open connection.
    ///
    /// Keeps going after a failure and reports the first one.
    pub fn close_all(&self) -> Result<()> {
        let mut connections = self.connections.lock();
        let mut first_error = None;
        while let Some((destination, conn)) = connections.pop_lru() {
            if let Err(e) = conn.close() {
                error!("failed to close connection for {}: {}", destination, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionCache {
    fn drop(&mut self) {
        // errors were already logged by close_all
        let _ = self.close_all();
    }
}

/// Create `path` from the template unless it exists, then wait until readable.
///
/// The file is created write-only and made readable once the template is
/// fully written, so a reader that can open it sees a complete database.
/// Concurrent creators race on `create_new`; losers wait for the winner.
fn ensure_database_exists(path: &Path, template: &[u8], timeout: Duration) -> Result<()> {
    if path.exists() {
        return wait_until_readable(path, timeout);
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o220);
    }

    match options.open(path) {
        Ok(mut file) => {
            file.write_all(template)?;
            file.sync_all()?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;
            }
            debug!("created {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => wait_until_readable(path, timeout),
        Err(e) => Err(e.into()),
    }
}

fn is_readable(path: &Path) -> bool {
    fs::File::open(path)
        .and_then(|file| file.metadata())
        .map(|meta| meta.len() > 0)
        .unwrap_or(false)
}

fn wait_until_readable(path: &Path, timeout: Duration) -> Result<()> {
    let start = Instant::now();
    loop {
        if is_readable(path) {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(StoreError::StoreUnavailable(format!(
                "database file {} cannot be read",
                path.display()
            ))
            .into());
        }
        std::thread::sleep(READABLE_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::EscapedFilenames;
    use tempfile::TempDir;

    fn cache_with_capacity(capacity: usize) -> (TempDir, ConnectionCache) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            cache_size: capacity,
            ..StoreConfig::new(dir.path().join("db"))
        };
        let cache = ConnectionCache::new(&config, Arc::new(EscapedFilenames)).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_root_created_lazily() {
        let (dir, cache) = cache_with_capacity(4);
        assert!(!dir.path().join("db").exists());

        cache.get("aff4:/C.1").unwrap();
        assert!(dir.path().join("db").is_dir());
        assert!(cache.path_for("aff4:/C.1").is_file());
    }

    #[test]
    fn test_get_reuses_connection() {
        let (_dir, cache) = cache_with_capacity(4);
        let first = cache.get("S").unwrap();
        let second = cache.get("S").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let (_dir, cache) = cache_with_capacity(3);
        let a = cache.get("A").unwrap();
        cache.get("B").unwrap();
        cache.get("C").unwrap();
        // touch A and B so C becomes least recently used
        cache.get("A").unwrap();
        let b = cache.get("B").unwrap();
        cache.get("D").unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("A"));
        assert!(!cache.contains("C"));
        assert!(!a.is_closed());
        assert!(!b.is_closed());
    }

    #[test]
    fn test_evicted_connection_is_flushed_and_closed() {
        let (_dir, cache) = cache_with_capacity(2);
        let first = cache.get("S1").unwrap();
        {
            let guard = first.lock();
            guard.insert("S1", "p", b"v", 1).unwrap();
        }
        cache.get("S2").unwrap();
        cache.get("S3").unwrap();

        assert_eq!(cache.len(), 2);
        assert!(first.is_closed());

        let reopened = cache.get("S1").unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
        assert_eq!(
            reopened.lock().newest_value("S1", "p").unwrap(),
            Some((b"v".to_vec(), 1))
        );
    }

    #[test]
    fn test_failed_eviction_flush_still_releases_handle() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            cache_size: 1,
            busy_timeout_ms: 10,
            ..StoreConfig::new(dir.path().join("db"))
        };
        let cache = ConnectionCache::new(&config, Arc::new(EscapedFilenames)).unwrap();

        let first = cache.get("A").unwrap();
        let guard = first.lock();
        guard.insert("A", "p", b"v", 1).unwrap();

        let reader = rusqlite::Connection::open(cache.path_for("A")).unwrap();
        reader.execute_batch("BEGIN").unwrap();
        let _: i64 = reader
            .query_row("SELECT COUNT(*) FROM tbl", [], |row| row.get(0))
            .unwrap();

        // evicting A cannot commit, but the caller still gets B
        let second = cache.get("B").unwrap();
        assert!(!second.is_closed());
        assert!(first.is_closed());
        assert!(!cache.contains("A"));
        drop(guard);
        reader.execute_batch("ROLLBACK").unwrap();

        let reopened = cache.get("A").unwrap();
        assert!(!Arc::ptr_eq(&first, &reopened));
        assert_eq!(reopened.lock().newest_value("A", "p").unwrap(), None);
    }

    #[test]
    fn test_discard_only_removes_the_same_connection() {
        let (_dir, cache) = cache_with_capacity(2);
        let conn = cache.get("S").unwrap();
        conn.close().unwrap();
        assert!(cache.contains("S"));

        assert!(cache.discard("S", &conn));
        assert!(!cache.contains("S"));
        assert!(!cache.discard("S", &conn));

        let fresh = cache.get("S").unwrap();
        assert!(!cache.discard("S", &conn));
        assert!(cache.contains("S"));
        assert!(!fresh.is_closed());
    }

    #[test]
    fn test_existing_file_is_opened_not_recreated() {
        let (_dir, cache) = cache_with_capacity(1);
        cache.get("S").unwrap().lock().insert("S", "p", b"v", 1).unwrap();
        cache.close_all().unwrap();
        assert!(cache.is_empty());

        let conn = cache.get("S").unwrap();
        assert!(conn.lock().newest_value("S", "p").unwrap().is_some());
    }

    #[test]
    fn test_unreadable_file_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sqlite");
        fs::write(&path, b"").unwrap();

        let err = wait_until_readable(&path, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(
            StoreError::from(err),
            StoreError::StoreUnavailable(_)
        ));
    }

    #[test]
    fn test_concurrent_creators_share_one_file() {
        let (_dir, cache) = cache_with_capacity(8);
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    let conn = cache.get("shared").unwrap();
                    conn.lock().insert("shared", "p", b"v", i).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let conn = cache.get("shared").unwrap();
        let rows = conn.lock().values_in_range("shared", "p", 0, i64::MAX, 0).unwrap();
        assert_eq!(rows.len(), 8);
        assert_eq!(cache.len(), 1);
    }
}
