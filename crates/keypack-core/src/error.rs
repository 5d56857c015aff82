use thiserror::Error;

/// Top-level error type for the key package store.
///
/// Storage failures carry the SQLite extended result code verbatim so callers
/// can log it; the store never interprets it further.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeypackError {
    #[error("Package store is not open")]
    NotOpen,

    #[error("Storage unavailable{}: {message}", code_suffix(.code))]
    StorageUnavailable { code: Option<i32>, message: String },

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeypackError {
    /// Build a `StorageUnavailable` error without an engine code.
    pub fn storage(message: impl Into<String>) -> Self {
        KeypackError::StorageUnavailable {
            code: None,
            message: message.into(),
        }
    }

    /// Whether a caller may reasonably retry the failed operation.
    ///
    /// Everything except a constraint violation is treated as transient; a
    /// constraint violation means the caller passed a malformed key.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, KeypackError::ConstraintViolation(_))
    }
}

impl From<toml::de::Error> for KeypackError {
    fn from(err: toml::de::Error) -> Self {
        KeypackError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for KeypackError {
    fn from(err: toml::ser::Error) -> Self {
        KeypackError::Config(err.to_string())
    }
}

fn code_suffix(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!(" (code {c})"),
        None => String::new(),
    }
}

/// A specialized `Result` type for key package operations.
pub type Result<T> = std::result::Result<T, KeypackError>;
