//! Error types for metric-history
//!
//! Toyota Way: Clear error messages with actionable guidance (Respect for People)

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// metric-history error types
#[derive(Error, Debug)]
pub enum Error {
    /// Store could not be opened safely (fatal at startup)
    #[error("Storage error: {0}\nThe history database must not be used until this is resolved.")]
    Storage(String),

    /// A multi-row write failed and was rolled back
    #[error("Transaction rolled back: {0}")]
    Transaction(String),

    /// Invalid configuration (weights, thresholds, policy values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// A lookup that must hit a row found nothing
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record looked up
        entity: &'static str,
        /// Identifier used for the lookup
        id: String,
    },

    /// Lock contention outlasted the busy timeout
    #[error("Database busy: {0}\nAnother writer held the lock past the busy timeout; retry later.")]
    Busy(String),

    /// SQLite error
    #[error("Database error: {0}")]
    Database(#[source] rusqlite::Error),

    /// JSON encoding/decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for Error {
    /// Lock timeouts surface as [`Error::Busy`], everything else as [`Error::Database`].
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            _ => Self::Database(err),
        }
    }
}

impl Error {
    /// Wrap a failure that happened inside a write transaction.
    ///
    /// Busy errors pass through unchanged so callers can still retry them.
    pub(crate) fn rolled_back(context: &str, err: Self) -> Self {
        match err {
            Self::Busy(_) => err,
            other => Self::Transaction(format!("{context}: {other}")),
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
