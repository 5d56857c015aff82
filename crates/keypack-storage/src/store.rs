//! Store trait for downloaded key packages.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use keypack_core::error::{KeypackError, Result};
use keypack_core::types::{Day, Hour, Package};

use crate::retention::PurgeResult;

/// Storage for downloaded diagnostic key packages.
///
/// Keys are `(country, day, hour)`, with no hour for daily packages. Daily
/// and hourly packages of the same day are independent entries. Keys arrive
/// as raw strings and are validated on every call; malformed input yields
/// [`KeypackError::ConstraintViolation`] before storage is touched.
///
/// Every operation except `open`, `close` and `is_open` fails with
/// [`KeypackError::NotOpen`] on a closed store. Lookups that find nothing
/// return an empty result, never an error.
pub trait PackageStore: Send + Sync {
    /// Acquire the storage handle, creating the schema if needed. No-op when
    /// already open.
    fn open(&self) -> Result<()>;

    /// Flush pending writes and release the storage handle. No-op when
    /// already closed.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Remove every package of every country. The schema stays.
    fn reset(&self) -> Result<()>;

    /// Insert or replace the hourly package at `(country, day, hour)`.
    fn set_hourly(
        &self,
        country: &str,
        day: &str,
        hour: u8,
        etag: Option<&str>,
        payload: &[u8],
    ) -> Result<()>;

    /// Insert or replace the daily package at `(country, day)`.
    ///
    /// Use [`spawn_set_daily`] to run this off the calling thread.
    fn set_daily(&self, country: &str, day: &str, etag: Option<&str>, payload: &[u8])
        -> Result<()>;

    /// All packages, daily or hourly, whose stored ETag equals `etag`.
    fn packages_with_etag(&self, etag: &str) -> Result<Vec<Package>>;

    /// The daily package for `(country, day)`. Hourly packages are never
    /// combined into a substitute.
    fn package(&self, day: &str, country: &str) -> Result<Option<Package>>;

    /// Hourly packages of the day in ascending hour order. Missing hours are
    /// skipped, so the result need not be contiguous.
    fn hourly_packages(&self, day: &str, country: &str) -> Result<Vec<Package>>;

    /// Distinct days with any package for the country, ascending.
    fn all_days(&self, country: &str) -> Result<Vec<Day>>;

    /// Hours with an hourly package for the day, ascending.
    fn hours(&self, day: &str, country: &str) -> Result<Vec<Hour>>;

    /// Delete every package whose day falls before the retention cutoff
    /// computed from `now`. Atomic: on error the store is unchanged.
    fn delete_outdated_days(&self, now: DateTime<Utc>) -> Result<PurgeResult>;

    /// Drop the daily package of `(country, day)`. Returns whether one existed.
    fn delete_day_package(&self, day: &str, country: &str) -> Result<bool>;

    /// Drop the hourly package of `(country, day, hour)`. Returns whether one
    /// existed.
    fn delete_hour_package(&self, day: &str, hour: u8, country: &str) -> Result<bool>;
}

/// Run [`PackageStore::set_daily`] on the blocking pool.
///
/// The returned handle is the completion signal: awaiting it yields the
/// write's result. Dropping it does not cancel the write. Must be called
/// from within a tokio runtime.
pub fn spawn_set_daily<S>(
    store: Arc<S>,
    country: String,
    day: String,
    etag: Option<String>,
    payload: Vec<u8>,
) -> JoinHandle<Result<()>>
where
    S: PackageStore + ?Sized + 'static,
{
    tokio::task::spawn_blocking(move || {
        store.set_daily(&country, &day, etag.as_deref(), &payload)
    })
}

/// Await a handle from [`spawn_set_daily`], folding a panicked or aborted
/// task into a storage error.
pub async fn join_write(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .await
        .map_err(|e| KeypackError::storage(format!("Background write failed: {}", e)))?
}
