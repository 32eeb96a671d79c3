//! # kennel-db
//!
//! Contract index for the kennel provider, kept in a single SQLite database
//! at `<home>/data/kennel.db`.
//!
//! ## Schema
//!
//! The index is an ordered key/value table with ASCII keys and values so it
//! can be inspected with the `sqlite3` shell:
//!
//! | Key           | Value                          |
//! |---------------|--------------------------------|
//! | `FILE-<cid>`  | `<fid>`                        |
//! | `DWNT-<cid>`  | decimal miss counter           |
//! | `<fid>`       | comma-joined CIDs, may be stale |
//!
//! Each statement is atomic on its own. Compound updates are not wrapped in
//! a transaction; readers treat a missing counter as zero and cross-check
//! reverse-list entries against `FILE-<cid>`.
//!
//! ## Modules
//!
//! - [`queries::kv`] — Point reads/writes and prefix scans.
//! - [`queries::contracts`] — Contract index operations.

pub mod migrations;
pub mod queries;
pub mod schema;

use rusqlite::Connection;
use std::path::Path;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Database file name inside the data directory.
pub const DB_FILE: &str = "kennel.db";

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Open or create the database at the given path.
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

/// Open `<data_dir>/kennel.db`, creating the directory if needed.
pub fn open_dir(data_dir: &Path) -> Result<Connection> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| DbError::Migration(format!("create {}: {e}", data_dir.display())))?;
    open(&data_dir.join(DB_FILE))
}

/// Open an in-memory database (for testing).
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrations::run(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_memory() {
        let conn = open_memory().expect("open in-memory db");
        let version: u32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("get user_version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_open_dir_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data = dir.path().join("data");
        {
            let conn = open_dir(&data).expect("open");
            queries::kv::put(&conn, "k", "v").expect("put");
        }
        let conn = open_dir(&data).expect("reopen");
        assert_eq!(queries::kv::get(&conn, "k").expect("get").as_deref(), Some("v"));
    }
}
