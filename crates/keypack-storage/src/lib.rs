//! Keypack Storage crate - SQLite persistence for downloaded diagnostic key
//! packages, retention purge, and the background purge scheduler.
//!
//! Provides a WAL-mode SQLite database with migrations, the [`PackageStore`]
//! trait with its SQLite implementation, and day-granular retention.

pub mod db;
pub mod migrations;
pub mod repository;
pub mod retention;
pub mod scheduler;
pub mod store;

pub use db::Database;
pub use repository::SqlitePackageStore;
pub use retention::{purge_before, PurgeResult, RetentionPolicy};
pub use scheduler::RetentionScheduler;
pub use store::{join_write, spawn_set_daily, PackageStore};
