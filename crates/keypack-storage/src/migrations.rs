//! Database schema migrations.
//!
//! Applies the initial schema: the `key_packages` relation and the
//! `schema_migrations` tracking table.

use rusqlite::Connection;
use tracing::info;

use keypack_core::error::Result;

use crate::db::storage_error;

/// Run all pending database migrations.
///
/// Only version 1 exists. Later migrations check the current version and
/// apply incremental changes on top.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| storage_error("Failed to create migrations table", e))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| storage_error("Failed to query migration version", e))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: key_packages");
    }

    Ok(())
}

/// Version 1: key package relation.
///
/// `hour` is NULL for daily packages. SQLite treats NULLs as distinct in
/// unique indexes, so the natural key index folds NULL to -1.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        CREATE TABLE IF NOT EXISTS key_packages (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            country     TEXT NOT NULL CHECK (length(country) BETWEEN 1 AND 16),
            day         TEXT NOT NULL CHECK (length(day) = 10),
            hour        INTEGER CHECK (hour IS NULL OR hour BETWEEN 0 AND 23),
            etag        TEXT,
            payload     BLOB NOT NULL,
            created_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_key_packages_natural_key
            ON key_packages (country, day, COALESCE(hour, -1));

        CREATE INDEX IF NOT EXISTS idx_key_packages_etag
            ON key_packages (etag)
            WHERE etag IS NOT NULL;

        CREATE INDEX IF NOT EXISTS idx_key_packages_day
            ON key_packages (day);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'key_packages');

        COMMIT;
        ",
    )
    .map_err(|e| storage_error("Failed to apply migration v1", e))?;
    Ok(())
}
