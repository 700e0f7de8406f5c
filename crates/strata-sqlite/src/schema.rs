//! On-disk schema and the database template
//!
//! Every database file starts life as a byte copy of a template built once
//! per cache, so concurrent creators race on a single `create_new` open.

use std::time::Duration;

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

/// Versioned attribute cells and subject leases
const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tbl (
        subject VARCHAR(512) NOT NULL,
        predicate VARCHAR(512) NOT NULL,
        timestamp BIG INTEGER NOT NULL,
        value BLOB
    );
    CREATE TABLE IF NOT EXISTS lock (
        subject VARCHAR(512) PRIMARY KEY NOT NULL,
        expires BIG INTEGER NOT NULL,
        token BIG INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS tbl_index ON tbl (subject, predicate, timestamp);
";

/// Prepared statements kept per connection
pub const CACHED_STATEMENTS: usize = 20;

/// Create the data and lock tables. Idempotent.
pub fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Apply the per-connection pragmas.
///
/// The rollback journal is kept in memory so a failed batch can still be
/// rolled back without leaving journal files next to the databases.
pub fn configure(conn: &Connection, busy_timeout: Duration) -> Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.set_prepared_statement_cache_capacity(CACHED_STATEMENTS);
    // journal_mode returns the resulting mode as a row
    let _mode: String = conn.query_row("PRAGMA journal_mode = MEMORY", [], |row| row.get(0))?;
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = 10000;",
    )?;
    Ok(())
}

/// Build a fresh database in a scratch file and return its bytes.
pub fn build_template() -> Result<Vec<u8>> {
    let scratch = tempfile::Builder::new()
        .prefix("strata-template")
        .suffix(".sqlite")
        .tempfile()?;

    {
        let conn = Connection::open(scratch.path())?;
        create_schema(&conn)?;
        conn.execute_batch("PRAGMA synchronous = FULL;")?;
        conn.close().map_err(|(_, e)| e)?;
    }

    let template = std::fs::read(scratch.path())?;
    info!("built database template ({} bytes)", template.len());
    Ok(template)
}
