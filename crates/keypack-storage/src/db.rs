//! Database connection management.
//!
//! Wraps a single rusqlite Connection in a Mutex for thread-safe access.
//! Configures WAL mode and recommended PRAGMAs on initialization.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{Connection, Transaction};
use tracing::info;

use keypack_core::error::{KeypackError, Result};

use crate::migrations;

/// Default busy timeout for connections opened without a config.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Map a rusqlite error into the store's error surface, keeping the SQLite
/// extended result code when there is one.
pub(crate) fn storage_error(context: &str, err: rusqlite::Error) -> KeypackError {
    let code = match &err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.extended_code),
        _ => None,
    };
    KeypackError::StorageUnavailable {
        code,
        message: format!("{}: {}", context, err),
    }
}

/// Thread-safe SQLite database wrapper.
///
/// All access, reads included, is serialized through the mutex, so writes to
/// the same key commit one after another and never interleave.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database at the given path.
    ///
    /// Configures WAL mode, synchronous=NORMAL and the busy timeout, then runs
    /// all pending migrations.
    pub fn new(path: &Path, busy_timeout: Duration) -> Result<Self> {
        // Ensure parent directory exists.
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    KeypackError::storage(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| storage_error("Failed to open database", e))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| storage_error("Failed to set pragmas", e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| storage_error("Failed to set busy timeout", e))?;

        info!("Database opened at {}", path.display());

        Self::with_migrations(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| storage_error("Failed to open in-memory db", e))?;

        Self::with_migrations(conn)
    }

    fn with_migrations(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Execute a closure with a reference to the underlying connection.
    ///
    /// The mutex is held for the duration of the closure.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| KeypackError::storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a closure inside an immediate transaction.
    ///
    /// Commits when the closure returns `Ok`, rolls back otherwise, leaving
    /// the database as it was before the call.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| KeypackError::storage(format!("Database lock poisoned: {}", e)))?;
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(|e| storage_error("Failed to begin transaction", e))?;
        // Dropping an uncommitted transaction rolls it back.
        let value = f(&tx)?;
        tx.commit()
            .map_err(|e| storage_error("Failed to commit transaction", e))?;
        Ok(value)
    }

    /// Flush the WAL into the main database file.
    pub fn checkpoint(&self) -> Result<()> {
        self.with_conn(|conn| {
            // In-memory databases have no WAL; the pragma is a no-op there.
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
                .map_err(|e| storage_error("WAL checkpoint failed", e))
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
