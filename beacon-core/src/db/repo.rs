//! Database handle
//!
//! A single SQLite connection behind a mutex. Every read and write goes
//! through it, which makes the connection the one serialized execution
//! context for the store: there are never two writers racing on eviction.
//! Queue and module-storage queries live in sibling modules as further
//! `impl Database` blocks.

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Database handle with a single serialized connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations, then drop module values scoped to the previous process.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        super::schema::run_migrations(&conn)?;
        let removed = Self::delete_until_restart(&conn)?;
        if removed > 0 {
            tracing::debug!(removed, "Dropped restart-scoped module values");
        }
        Ok(())
    }

    /// Get the underlying connection (for advanced use)
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn()
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("database connection lock poisoned".to_string()))
    }

    /// Get the database file size in bytes.
    pub fn get_database_size(&self) -> Result<u64> {
        let conn = self.conn()?;

        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(page_count * page_size)
    }
}
