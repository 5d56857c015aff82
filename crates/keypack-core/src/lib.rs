//! Keypack core - domain types, errors, configuration and logging for the
//! on-device diagnostic key package store.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::KeypackConfig;
pub use error::{KeypackError, Result};
pub use logging::init_tracing;
pub use types::*;
