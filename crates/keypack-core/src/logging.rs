//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` takes precedence; otherwise `default_level` (usually
/// `general.log_level` from the config) is used. Returns `false` if a
/// subscriber was already installed, which is not an error.
pub fn init_tracing(default_level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
