//! Integration tests for the SQLite package store.
//!
//! Exercise the public `PackageStore` surface only: upsert semantics, key
//! isolation between daily and hourly packages, ETag lookup, ordering,
//! retention, reset, lifecycle errors and concurrent writers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, TimeZone, Utc};

use keypack_core::{Granularity, KeypackError};
use keypack_storage::{
    join_write, spawn_set_daily, PackageStore, RetentionPolicy, SqlitePackageStore,
};

// =============================================================================
// Helpers
// =============================================================================

fn make_store() -> SqlitePackageStore {
    let store = SqlitePackageStore::in_memory(RetentionPolicy::default());
    store.open().unwrap();
    store
}

fn day_strings(store: &impl PackageStore, country: &str) -> Vec<String> {
    store
        .all_days(country)
        .unwrap()
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn hour_values(store: &impl PackageStore, day: &str, country: &str) -> Vec<u8> {
    store
        .hours(day, country)
        .unwrap()
        .iter()
        .map(|h| h.value())
        .collect()
}

fn noon(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

// =============================================================================
// Upsert and key isolation
// =============================================================================

#[test]
fn test_upsert_second_write_wins() {
    let store = make_store();
    store.set_hourly("US", "2021-01-01", 5, Some("first"), b"aaa").unwrap();
    store.set_hourly("US", "2021-01-01", 5, Some("second"), b"bbb").unwrap();

    let hourly = store.hourly_packages("2021-01-01", "US").unwrap();
    assert_eq!(hourly.len(), 1);
    assert_eq!(hourly[0].etag.as_deref(), Some("second"));
    assert_eq!(hourly[0].payload, b"bbb");
    assert!(store.packages_with_etag("first").unwrap().is_empty());
}

#[test]
fn test_upsert_can_clear_etag() {
    let store = make_store();
    store.set_daily("US", "2021-01-01", Some("tagged"), b"aaa").unwrap();
    store.set_daily("US", "2021-01-01", None, b"bbb").unwrap();

    let daily = store.package("2021-01-01", "US").unwrap().unwrap();
    assert_eq!(daily.etag, None);
    assert!(store.packages_with_etag("tagged").unwrap().is_empty());
}

#[test]
fn test_hourly_write_does_not_touch_daily_or_other_hours() {
    let store = make_store();
    store.set_hourly("US", "2021-01-01", 4, Some("h4"), b"four").unwrap();
    store.set_hourly("US", "2021-01-01", 5, Some("h5"), b"five").unwrap();

    assert!(store.package("2021-01-01", "US").unwrap().is_none());

    store.set_hourly("US", "2021-01-01", 5, Some("h5b"), b"five-b").unwrap();
    let hourly = store.hourly_packages("2021-01-01", "US").unwrap();
    assert_eq!(hourly.len(), 2);
    assert_eq!(hourly[0].etag.as_deref(), Some("h4"));
    assert_eq!(hourly[0].payload, b"four");
}

#[test]
fn test_daily_and_hourly_coexist() {
    let store = make_store();
    store.set_daily("DE", "2021-03-10", Some("a1"), b"daily").unwrap();
    store.set_hourly("DE", "2021-03-10", 14, Some("b2"), b"hourly").unwrap();

    let daily = store.package("2021-03-10", "DE").unwrap().unwrap();
    assert_eq!(daily.etag.as_deref(), Some("a1"));
    assert_eq!(daily.granularity(), Granularity::Day);
    assert_eq!(daily.payload, b"daily");

    assert_eq!(hour_values(&store, "2021-03-10", "DE"), vec![14]);

    let by_b2 = store.packages_with_etag("b2").unwrap();
    assert_eq!(by_b2.len(), 1);
    assert_eq!(by_b2[0].granularity(), Granularity::Hour);
    assert_eq!(by_b2[0].hour().map(|h| h.value()), Some(14));
    assert_eq!(by_b2[0].payload, b"hourly");

    let by_a1 = store.packages_with_etag("a1").unwrap();
    assert_eq!(by_a1.len(), 1);
    assert_eq!(by_a1[0], daily);
}

#[test]
fn test_countries_are_isolated() {
    let store = make_store();
    store.set_daily("DE", "2021-03-10", None, b"de").unwrap();
    store.set_daily("FR", "2021-03-11", None, b"fr").unwrap();

    assert_eq!(day_strings(&store, "DE"), vec!["2021-03-10"]);
    assert_eq!(day_strings(&store, "FR"), vec!["2021-03-11"]);
    assert!(store.package("2021-03-10", "FR").unwrap().is_none());
}

#[test]
fn test_daily_without_hourly_reports_no_hours() {
    let store = make_store();
    store.set_daily("DE", "2021-03-10", None, b"daily").unwrap();
    assert!(store.hours("2021-03-10", "DE").unwrap().is_empty());
    assert!(store.hourly_packages("2021-03-10", "DE").unwrap().is_empty());
}

// =============================================================================
// ETag lookup
// =============================================================================

#[test]
fn test_etag_lookup_matches_exactly_the_tagged_set() {
    let store = make_store();
    store.set_daily("DE", "2021-03-10", Some("shared"), b"1").unwrap();
    store.set_hourly("FR", "2021-03-09", 2, Some("shared"), b"2").unwrap();
    store.set_hourly("FR", "2021-03-09", 3, Some("other"), b"3").unwrap();
    store.set_hourly("FR", "2021-03-09", 4, None, b"4").unwrap();

    let shared = store.packages_with_etag("shared").unwrap();
    assert_eq!(shared.len(), 2);
    assert!(shared.iter().all(|p| p.etag.as_deref() == Some("shared")));

    assert_eq!(store.packages_with_etag("other").unwrap().len(), 1);
    assert!(store.packages_with_etag("never-written").unwrap().is_empty());
    assert!(store.packages_with_etag("").unwrap().is_empty());
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn test_hourly_packages_ascending_and_sparse() {
    let store = make_store();
    for hour in [23u8, 0, 7, 12] {
        store
            .set_hourly("DE", "2021-03-10", hour, None, &[hour])
            .unwrap();
    }

    let hourly = store.hourly_packages("2021-03-10", "DE").unwrap();
    let hours: Vec<u8> = hourly.iter().filter_map(|p| p.hour()).map(|h| h.value()).collect();
    assert_eq!(hours, vec![0, 7, 12, 23]);
    assert!(hourly.iter().all(|p| p.payload == vec![p.hour().unwrap().value()]));
    assert_eq!(hour_values(&store, "2021-03-10", "DE"), vec![0, 7, 12, 23]);
}

#[test]
fn test_all_days_ascending_and_distinct() {
    let store = make_store();
    store.set_daily("DE", "2021-03-10", None, b"x").unwrap();
    store.set_hourly("DE", "2021-03-10", 1, None, b"x").unwrap();
    store.set_hourly("DE", "2020-12-31", 1, None, b"x").unwrap();
    store.set_daily("DE", "2021-01-02", None, b"x").unwrap();

    assert_eq!(
        day_strings(&store, "DE"),
        vec!["2020-12-31", "2021-01-02", "2021-03-10"]
    );
}

#[test]
fn test_empty_reads_are_not_errors() {
    let store = make_store();
    assert!(store.package("2021-03-10", "DE").unwrap().is_none());
    assert!(store.hourly_packages("2021-03-10", "DE").unwrap().is_empty());
    assert!(store.all_days("DE").unwrap().is_empty());
    assert!(store.hours("2021-03-10", "DE").unwrap().is_empty());
}

// =============================================================================
// Retention
// =============================================================================

#[test]
fn test_retention_purges_old_day() {
    let store = make_store();
    store.set_daily("FR", "2021-01-01", None, b"old").unwrap();

    let result = store.delete_outdated_days(noon(2021, 6, 1)).unwrap();
    assert_eq!(result.cutoff.to_string(), "2021-05-18");
    assert_eq!(result.packages_deleted, 1);
    assert!(store.all_days("FR").unwrap().is_empty());
}

#[test]
fn test_retention_keeps_days_at_or_after_cutoff() {
    let store = make_store();
    store.set_daily("DE", "2021-05-17", Some("gone"), b"old").unwrap();
    store.set_hourly("DE", "2021-05-17", 9, Some("gone-h"), b"old-h").unwrap();
    store.set_daily("DE", "2021-05-18", Some("kept"), b"edge").unwrap();
    store.set_hourly("FR", "2021-05-30", 3, Some("kept-h"), b"recent").unwrap();

    let result = store.delete_outdated_days(noon(2021, 6, 1)).unwrap();
    assert_eq!(result.days_deleted, 1);
    assert_eq!(result.packages_deleted, 2);

    assert_eq!(day_strings(&store, "DE"), vec!["2021-05-18"]);
    assert_eq!(day_strings(&store, "FR"), vec!["2021-05-30"]);
    assert_eq!(
        store.package("2021-05-18", "DE").unwrap().unwrap().payload,
        b"edge"
    );
    let recent = store.hourly_packages("2021-05-30", "FR").unwrap();
    assert_eq!(recent[0].payload, b"recent");
    assert!(store.packages_with_etag("gone-h").unwrap().is_empty());
}

#[test]
fn test_retention_uses_configured_window() {
    let store = SqlitePackageStore::in_memory(RetentionPolicy::new(3).unwrap());
    store.open().unwrap();
    store.set_daily("DE", "2021-05-28", None, b"x").unwrap();
    store.set_daily("DE", "2021-05-29", None, b"x").unwrap();

    store.delete_outdated_days(noon(2021, 6, 1)).unwrap();
    assert_eq!(day_strings(&store, "DE"), vec!["2021-05-29"]);
}

// =============================================================================
// Reset and lifecycle
// =============================================================================

#[test]
fn test_reset_empties_every_country() {
    let store = make_store();
    store.set_daily("DE", "2021-03-10", None, b"x").unwrap();
    store.set_hourly("FR", "2021-03-11", 1, None, b"x").unwrap();
    store.set_hourly("EUR", "2021-03-12", 2, None, b"x").unwrap();

    store.reset().unwrap();
    for country in ["DE", "FR", "EUR"] {
        assert!(store.all_days(country).unwrap().is_empty());
    }

    // Schema survives a reset.
    store.set_daily("DE", "2021-03-10", None, b"again").unwrap();
    assert_eq!(day_strings(&store, "DE"), vec!["2021-03-10"]);
}

#[test]
fn test_closed_store_rejects_everything() {
    let store = make_store();
    store.close().unwrap();
    assert!(!store.is_open());

    assert!(matches!(
        store.set_daily("DE", "2021-03-10", None, b"x"),
        Err(KeypackError::NotOpen)
    ));
    assert!(matches!(
        store.set_hourly("DE", "2021-03-10", 1, None, b"x"),
        Err(KeypackError::NotOpen)
    ));
    assert!(matches!(store.packages_with_etag("e"), Err(KeypackError::NotOpen)));
    assert!(matches!(store.package("2021-03-10", "DE"), Err(KeypackError::NotOpen)));
    assert!(matches!(
        store.hourly_packages("2021-03-10", "DE"),
        Err(KeypackError::NotOpen)
    ));
    assert!(matches!(store.all_days("DE"), Err(KeypackError::NotOpen)));
    assert!(matches!(store.hours("2021-03-10", "DE"), Err(KeypackError::NotOpen)));
    assert!(matches!(
        store.delete_outdated_days(noon(2021, 6, 1)),
        Err(KeypackError::NotOpen)
    ));
    assert!(matches!(store.reset(), Err(KeypackError::NotOpen)));
    assert!(matches!(
        store.delete_day_package("2021-03-10", "DE"),
        Err(KeypackError::NotOpen)
    ));
}

#[test]
fn test_malformed_read_keys_are_constraint_violations() {
    let store = make_store();
    let err = store.package("10.03.2021", "DE").unwrap_err();
    assert!(matches!(err, KeypackError::ConstraintViolation(_)));
    assert!(!err.is_retryable());
    assert!(matches!(
        store.hours("2021-03-10", "not a country"),
        Err(KeypackError::ConstraintViolation(_))
    ));
}

#[test]
fn test_file_store_unavailable_location() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let store = SqlitePackageStore::new(blocker.join("packages.db"), RetentionPolicy::default());
    let err = store.open().unwrap_err();
    assert!(matches!(err, KeypackError::StorageUnavailable { .. }));
    assert!(err.is_retryable());
    assert!(!store.is_open());
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_writers_different_keys() {
    let store = Arc::new(make_store());
    let handles: Vec<_> = (0..24u8)
        .map(|hour| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .set_hourly("DE", "2021-03-10", hour, Some(format!("e{hour}").as_str()), &[hour])
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected: Vec<u8> = (0..24).collect();
    assert_eq!(hour_values(store.as_ref(), "2021-03-10", "DE"), expected);
}

#[test]
fn test_concurrent_writers_same_key_leave_one_row() {
    let store = Arc::new(make_store());
    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                store
                    .set_daily("DE", "2021-03-10", Some(format!("v{i}").as_str()), &[i; 32])
                    .unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let daily = store.package("2021-03-10", "DE").unwrap().unwrap();
    let tag = daily.etag.clone().unwrap();
    let writer: u8 = tag.trim_start_matches('v').parse().unwrap();
    // Payload and ETag come from the same write.
    assert_eq!(daily.payload, vec![writer; 32]);
    assert_eq!(day_strings(store.as_ref(), "DE"), vec!["2021-03-10"]);
    assert_eq!(store.packages_with_etag(&tag).unwrap().len(), 1);
}

#[test]
fn test_readers_never_see_a_partially_purged_day() {
    let store = Arc::new(make_store());
    let days = ["2021-03-01", "2021-03-02", "2021-03-03", "2021-03-04"];
    for day in days {
        // Every package of a day shares one ETag, so a single lookup sees the
        // whole day or none of it.
        let tag = format!("batch-{day}");
        store.set_daily("DE", day, Some(tag.as_str()), b"daily").unwrap();
        for hour in 0..24u8 {
            store.set_hourly("DE", day, hour, Some(tag.as_str()), &[hour]).unwrap();
        }
    }
    store.set_daily("DE", "2021-06-01", None, b"recent").unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let store = Arc::clone(&store);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut reads = 0usize;
            loop {
                // Checked before the reads so at least one pass runs after the
                // purge has returned.
                let done = stop.load(Ordering::SeqCst);
                for day in days {
                    let tagged = store.packages_with_etag(&format!("batch-{day}")).unwrap();
                    assert!(
                        tagged.is_empty() || tagged.len() == 25,
                        "{} packages of {} visible",
                        tagged.len(),
                        day
                    );
                    let hourly = store.hourly_packages(day, "DE").unwrap();
                    assert!(
                        hourly.is_empty() || hourly.len() == 24,
                        "{} hourly packages of {} visible",
                        hourly.len(),
                        day
                    );
                    let daily = store.package(day, "DE").unwrap();
                    if hourly.is_empty() {
                        // Hours gone means the purge committed; the daily
                        // package went with them.
                        assert!(daily.is_none(), "daily package of {} outlived its hours", day);
                    }
                    reads += 1;
                }
                if done {
                    return reads;
                }
            }
        })
    };

    let result = store.delete_outdated_days(noon(2021, 6, 1)).unwrap();
    stop.store(true, Ordering::SeqCst);
    let reads = reader.join().unwrap();

    assert!(reads >= days.len());
    assert_eq!(result.days_deleted, 4);
    assert_eq!(result.packages_deleted, 100);
    assert_eq!(day_strings(store.as_ref(), "DE"), vec!["2021-06-01"]);
    for day in days {
        assert!(store.packages_with_etag(&format!("batch-{day}")).unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_spawned_daily_write_completes() {
    let store = Arc::new(make_store());
    let handle = spawn_set_daily(
        Arc::clone(&store),
        "DE".to_string(),
        "2021-03-10".to_string(),
        Some("async".to_string()),
        b"payload".to_vec(),
    );
    join_write(handle).await.unwrap();

    let daily = store.package("2021-03-10", "DE").unwrap().unwrap();
    assert_eq!(daily.etag.as_deref(), Some("async"));
}

#[tokio::test]
async fn test_spawned_daily_write_reports_failure() {
    let store: Arc<dyn PackageStore> = Arc::new(make_store());
    let handle = spawn_set_daily(
        store,
        "DE".to_string(),
        "2021-3-10".to_string(),
        None,
        Vec::new(),
    );
    let err = join_write(handle).await.unwrap_err();
    assert!(matches!(err, KeypackError::ConstraintViolation(_)));
}
