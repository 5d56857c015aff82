//! Retention window and purge of outdated days.
//!
//! A day is outdated once it falls before `today - retention_days`. Purging
//! removes daily and hourly packages of every country in one transaction, so
//! readers see either all of a day or none of it.

use chrono::{DateTime, Days, NaiveDate, Utc};
use tracing::info;

use keypack_core::config::{StorageConfig, MAX_RETENTION_DAYS};
use keypack_core::error::{KeypackError, Result};
use keypack_core::types::Day;

use crate::db::{storage_error, Database};

/// Result of a purge operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeResult {
    /// Days strictly before this were deleted.
    pub cutoff: Day,
    /// Number of distinct days removed across all countries.
    pub days_deleted: usize,
    /// Number of packages removed, daily and hourly.
    pub packages_deleted: usize,
}

/// How many days of packages the store keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    retention_days: u32,
}

impl RetentionPolicy {
    pub const DEFAULT_DAYS: u32 = 14;

    pub fn new(retention_days: u32) -> Result<Self> {
        if retention_days == 0 {
            return Err(KeypackError::Config(
                "retention window must be at least one day".to_string(),
            ));
        }
        if retention_days > MAX_RETENTION_DAYS {
            return Err(KeypackError::Config(format!(
                "retention window of {} days exceeds the maximum of {}",
                retention_days, MAX_RETENTION_DAYS
            )));
        }
        Ok(Self { retention_days })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        Self::new(config.retention_days)
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// First day still inside the window for the given moment.
    ///
    /// Saturates at the earliest representable date, where nothing is
    /// outdated.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Day {
        let cutoff = now
            .date_naive()
            .checked_sub_days(Days::new(u64::from(self.retention_days)))
            .unwrap_or(NaiveDate::MIN);
        Day::from_date(cutoff)
    }

    pub fn is_outdated(&self, day: Day, now: DateTime<Utc>) -> bool {
        day < self.cutoff(now)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: Self::DEFAULT_DAYS,
        }
    }
}

/// Delete every package whose day is strictly before `cutoff`.
///
/// Runs in a single immediate transaction. On failure nothing is deleted.
pub fn purge_before(db: &Database, cutoff: Day) -> Result<PurgeResult> {
    let cutoff_str = cutoff.to_canonical();

    let (days_deleted, packages_deleted) = db.with_tx(|tx| {
        let days: i64 = tx
            .query_row(
                "SELECT COUNT(DISTINCT day) FROM key_packages WHERE day < ?1",
                rusqlite::params![cutoff_str],
                |row| row.get(0),
            )
            .map_err(|e| storage_error("Purge day count failed", e))?;

        let deleted = tx
            .execute(
                "DELETE FROM key_packages WHERE day < ?1",
                rusqlite::params![cutoff_str],
            )
            .map_err(|e| storage_error("Purge deletion failed", e))?;

        Ok((days as usize, deleted))
    })?;

    info!(
        cutoff = %cutoff,
        days_deleted = days_deleted,
        packages_deleted = packages_deleted,
        "Purge of outdated days completed"
    );

    Ok(PurgeResult {
        cutoff,
        days_deleted,
        packages_deleted,
    })
}
