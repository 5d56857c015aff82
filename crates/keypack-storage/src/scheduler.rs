//! Background purge of outdated days.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use keypack_core::config::StorageConfig;

use crate::store::PackageStore;

/// Periodically calls [`PackageStore::delete_outdated_days`] with the
/// current time.
///
/// The first purge runs immediately. A failed purge is logged and tried
/// again at the next tick; there is no faster retry.
pub struct RetentionScheduler {
    store: Arc<dyn PackageStore>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl RetentionScheduler {
    pub fn new(store: Arc<dyn PackageStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn from_config(store: Arc<dyn PackageStore>, config: &StorageConfig) -> Self {
        let hours = u64::from(config.purge_interval_hours.max(1));
        Self::new(store, Duration::from_secs(hours * 3600))
    }

    /// Run purge cycles until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Retention scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.purge_once().await,
                _ = self.shutdown.notified() => {
                    info!("Retention scheduler stopped");
                    return;
                }
            }
        }
    }

    /// Run one purge on the blocking pool; the SQLite transaction never
    /// occupies a runtime worker.
    async fn purge_once(&self) {
        let store = Arc::clone(&self.store);
        let outcome =
            tokio::task::spawn_blocking(move || store.delete_outdated_days(Utc::now())).await;

        match outcome {
            Ok(Ok(result)) => info!(
                cutoff = %result.cutoff,
                packages_deleted = result.packages_deleted,
                "Scheduled purge finished"
            ),
            Ok(Err(e)) => warn!(error = %e, "Scheduled purge failed"),
            Err(e) => error!(error = %e, "Scheduled purge task panicked"),
        }
    }

    /// Signal the scheduler to stop. Safe to call before `run` starts.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}
