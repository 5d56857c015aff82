//! SQLite-backed [`PackageStore`].
//!
//! The store owns an optional [`Database`] handle behind a `RwLock`. Every
//! operation takes the read side for its duration, so `close` waits for
//! in-flight calls before it drops the connection.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use keypack_core::config::KeypackConfig;
use keypack_core::error::{KeypackError, Result};
use keypack_core::types::{Country, Day, Hour, Package, PackageKey};

use crate::db::{storage_error, Database, DEFAULT_BUSY_TIMEOUT};
use crate::retention::{self, PurgeResult, RetentionPolicy};
use crate::store::PackageStore;

const PACKAGE_COLUMNS: &str = "country, day, hour, etag, payload";

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Package store persisted in a single SQLite database.
pub struct SqlitePackageStore {
    location: Location,
    busy_timeout: Duration,
    retention: RetentionPolicy,
    db: RwLock<Option<Database>>,
}

impl SqlitePackageStore {
    /// Create a closed store backed by the database file at `path`.
    pub fn new(path: impl AsRef<Path>, retention: RetentionPolicy) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retention,
            db: RwLock::new(None),
        }
    }

    /// Create a closed in-memory store. Its contents are lost on `close`.
    pub fn in_memory(retention: RetentionPolicy) -> Self {
        Self {
            location: Location::Memory,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            retention,
            db: RwLock::new(None),
        }
    }

    /// Create a closed store from configuration.
    pub fn from_config(config: &KeypackConfig) -> Result<Self> {
        config.validate()?;
        let retention = RetentionPolicy::from_config(&config.storage)?;
        Ok(Self::new(config.database_path(), retention)
            .with_busy_timeout(Duration::from_millis(config.storage.busy_timeout_ms)))
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    /// Run `f` against the open database, or fail with `NotOpen`.
    fn with_db<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T>,
    {
        let guard = self
            .db
            .read()
            .map_err(|e| KeypackError::storage(format!("Store lock poisoned: {}", e)))?;
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(KeypackError::NotOpen),
        }
    }

    /// Upsert one package: the old row at the key is removed and the new one
    /// inserted in the same transaction.
    fn upsert(&self, key: PackageKey, etag: Option<&str>, payload: &[u8]) -> Result<()> {
        self.with_db(|db| {
            let day = key.day.to_canonical();
            let hour = key.hour.map(|h| i64::from(h.value()));

            let replaced = db.with_tx(|tx| {
                let replaced = tx
                    .execute(
                        "DELETE FROM key_packages
                         WHERE country = ?1 AND day = ?2 AND hour IS ?3",
                        rusqlite::params![key.country.as_str(), day, hour],
                    )
                    .map_err(|e| storage_error("Failed to replace package", e))?;
                tx.execute(
                    "INSERT INTO key_packages (country, day, hour, etag, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![key.country.as_str(), day, hour, etag, payload],
                )
                .map_err(|e| storage_error("Failed to store package", e))?;
                Ok(replaced > 0)
            })?;

            debug!(
                key = %key,
                etag = etag.unwrap_or(""),
                bytes = payload.len(),
                replaced = replaced,
                "Package stored"
            );
            Ok(())
        })
    }

    fn delete_one(&self, key: PackageKey) -> Result<bool> {
        self.with_db(|db| {
            let deleted = db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM key_packages
                     WHERE country = ?1 AND day = ?2 AND hour IS ?3",
                    rusqlite::params![
                        key.country.as_str(),
                        key.day.to_canonical(),
                        key.hour.map(|h| i64::from(h.value()))
                    ],
                )
                .map_err(|e| storage_error("Failed to delete package", e))
            })?;
            debug!(key = %key, deleted = deleted, "Package deleted");
            Ok(deleted > 0)
        })
    }

    /// Number of stored packages, for assertions in tests.
    #[cfg(test)]
    pub(crate) fn package_count(&self) -> Result<usize> {
        self.with_db(|db| {
            db.with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM key_packages", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map(|n| n as usize)
                .map_err(|e| storage_error("Failed to count packages", e))
            })
        })
    }
}

impl std::fmt::Debug for SqlitePackageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlitePackageStore")
            .field("location", &self.location)
            .field("retention", &self.retention)
            .field("open", &self.is_open())
            .finish()
    }
}

impl PackageStore for SqlitePackageStore {
    fn open(&self) -> Result<()> {
        let mut guard = self
            .db
            .write()
            .map_err(|e| KeypackError::storage(format!("Store lock poisoned: {}", e)))?;
        if guard.is_some() {
            return Ok(());
        }

        let db = match &self.location {
            Location::File(path) => Database::new(path, self.busy_timeout)?,
            Location::Memory => Database::in_memory()?,
        };
        *guard = Some(db);
        info!(location = ?self.location, "Package store opened");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut guard = self
            .db
            .write()
            .map_err(|e| KeypackError::storage(format!("Store lock poisoned: {}", e)))?;
        let Some(db) = guard.take() else {
            return Ok(());
        };

        // The handle is released even if the checkpoint fails; the WAL is
        // replayed on the next open.
        if let Err(e) = db.checkpoint() {
            warn!(error = %e, "WAL checkpoint on close failed");
        }
        drop(db);
        info!(location = ?self.location, "Package store closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.db.read().map(|guard| guard.is_some()).unwrap_or(false)
    }

    fn reset(&self) -> Result<()> {
        self.with_db(|db| {
            let deleted = db.with_tx(|tx| {
                tx.execute("DELETE FROM key_packages", [])
                    .map_err(|e| storage_error("Failed to reset store", e))
            })?;
            info!(packages_deleted = deleted, "Package store reset");
            Ok(())
        })
    }

    fn set_hourly(
        &self,
        country: &str,
        day: &str,
        hour: u8,
        etag: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        if !self.is_open() {
            return Err(KeypackError::NotOpen);
        }
        let key = PackageKey::hourly(Country::parse(country)?, Day::parse(day)?, Hour::new(hour)?);
        self.upsert(key, etag, payload)
    }

    fn set_daily(
        &self,
        country: &str,
        day: &str,
        etag: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        if !self.is_open() {
            return Err(KeypackError::NotOpen);
        }
        let key = PackageKey::daily(Country::parse(country)?, Day::parse(day)?);
        self.upsert(key, etag, payload)
    }

    fn packages_with_etag(&self, etag: &str) -> Result<Vec<Package>> {
        self.with_db(|db| {
            db.with_conn(|conn| {
                query_packages(
                    conn,
                    &format!(
                        "SELECT {PACKAGE_COLUMNS} FROM key_packages
                         WHERE etag = ?1
                         ORDER BY country, day, COALESCE(hour, -1)"
                    ),
                    rusqlite::params![etag],
                )
            })
        })
    }

    fn package(&self, day: &str, country: &str) -> Result<Option<Package>> {
        self.with_db(|db| {
            let country = Country::parse(country)?;
            let day = Day::parse(day)?;
            db.with_conn(|conn| {
                let row = conn
                    .query_row(
                        &format!(
                            "SELECT {PACKAGE_COLUMNS} FROM key_packages
                             WHERE country = ?1 AND day = ?2 AND hour IS NULL"
                        ),
                        rusqlite::params![country.as_str(), day.to_canonical()],
                        read_row,
                    )
                    .optional()
                    .map_err(|e| storage_error("Failed to read daily package", e))?;
                row.map(into_package).transpose()
            })
        })
    }

    fn hourly_packages(&self, day: &str, country: &str) -> Result<Vec<Package>> {
        self.with_db(|db| {
            let country = Country::parse(country)?;
            let day = Day::parse(day)?;
            db.with_conn(|conn| {
                query_packages(
                    conn,
                    &format!(
                        "SELECT {PACKAGE_COLUMNS} FROM key_packages
                         WHERE country = ?1 AND day = ?2 AND hour IS NOT NULL
                         ORDER BY hour ASC"
                    ),
                    rusqlite::params![country.as_str(), day.to_canonical()],
                )
            })
        })
    }

    fn all_days(&self, country: &str) -> Result<Vec<Day>> {
        self.with_db(|db| {
            let country = Country::parse(country)?;
            db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT DISTINCT day FROM key_packages
                         WHERE country = ?1
                         ORDER BY day ASC",
                    )
                    .map_err(|e| storage_error("Failed to prepare day query", e))?;
                let days = stmt
                    .query_map(rusqlite::params![country.as_str()], |row| {
                        row.get::<_, String>(0)
                    })
                    .map_err(|e| storage_error("Failed to list days", e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| storage_error("Failed to read day", e))?;

                days.iter().map(|d| stored_day(d)).collect()
            })
        })
    }

    fn hours(&self, day: &str, country: &str) -> Result<Vec<Hour>> {
        self.with_db(|db| {
            let country = Country::parse(country)?;
            let day = Day::parse(day)?;
            db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT hour FROM key_packages
                         WHERE country = ?1 AND day = ?2 AND hour IS NOT NULL
                         ORDER BY hour ASC",
                    )
                    .map_err(|e| storage_error("Failed to prepare hour query", e))?;
                let hours = stmt
                    .query_map(
                        rusqlite::params![country.as_str(), day.to_canonical()],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(|e| storage_error("Failed to list hours", e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| storage_error("Failed to read hour", e))?;

                hours.into_iter().map(stored_hour).collect()
            })
        })
    }

    fn delete_outdated_days(&self, now: DateTime<Utc>) -> Result<PurgeResult> {
        self.with_db(|db| retention::purge_before(db, self.retention.cutoff(now)))
    }

    fn delete_day_package(&self, day: &str, country: &str) -> Result<bool> {
        if !self.is_open() {
            return Err(KeypackError::NotOpen);
        }
        self.delete_one(PackageKey::daily(Country::parse(country)?, Day::parse(day)?))
    }

    fn delete_hour_package(&self, day: &str, hour: u8, country: &str) -> Result<bool> {
        if !self.is_open() {
            return Err(KeypackError::NotOpen);
        }
        self.delete_one(PackageKey::hourly(
            Country::parse(country)?,
            Day::parse(day)?,
            Hour::new(hour)?,
        ))
    }
}

type PackageRow = (String, String, Option<i64>, Option<String>, Vec<u8>);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PackageRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn query_packages(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Package>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| storage_error("Failed to prepare package query", e))?;
    let rows = stmt
        .query_map(params, read_row)
        .map_err(|e| storage_error("Failed to query packages", e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| storage_error("Failed to read package", e))?;
    rows.into_iter().map(into_package).collect()
}

/// Rows that fail key validation mean the file was altered behind our back.
fn into_package((country, day, hour, etag, payload): PackageRow) -> Result<Package> {
    let country = Country::parse(&country)
        .map_err(|_| KeypackError::storage(format!("corrupt country in store: {:?}", country)))?;
    let day = stored_day(&day)?;
    let hour = hour.map(stored_hour).transpose()?;
    Ok(Package {
        key: PackageKey { country, day, hour },
        etag,
        payload,
    })
}

fn stored_day(day: &str) -> Result<Day> {
    Day::parse(day).map_err(|_| KeypackError::storage(format!("corrupt day in store: {:?}", day)))
}

fn stored_hour(hour: i64) -> Result<Hour> {
    u8::try_from(hour)
        .ok()
        .and_then(|h| Hour::new(h).ok())
        .ok_or_else(|| KeypackError::storage(format!("corrupt hour in store: {}", hour)))
}
