//! Error types for the tracking client.
//!
//! All failures surface as [`PgClientError`]. Driver failures keep the
//! original `sqlx` error as their source and are augmented with the operation
//! name and the call site at which the query proxy was minted, so a failed
//! query points at the application call rather than internal plumbing.

use std::panic::Location;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PgClientError {
    /// Input rejected before any network I/O (bad channel name, bad config).
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// An immediate advisory-lock acquisition found the lock held elsewhere.
    /// Routine contention, distinguishable so callers can branch on it.
    #[error("Advisory lock busy: {key}")]
    LockBusy { key: String },

    /// An underlying database failure, passed through unmodified apart from
    /// the operation/call-site augmentation.
    #[error("Operation '{operation}' failed at {location}: {source}")]
    Driver {
        operation: String,
        location: &'static Location<'static>,
        #[source]
        source: sqlx::Error,
    },

    /// Programming-error misuse of the client lifecycle (`start` twice,
    /// `stop` or query minting before `start`).
    #[error("Lifecycle error: {message}")]
    Lifecycle { message: String },
}

impl PgClientError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a lock-busy error for the given caller-supplied key.
    pub fn lock_busy(key: impl Into<String>) -> Self {
        Self::LockBusy { key: key.into() }
    }

    /// Create a driver error augmented with operation and call site.
    pub fn driver(
        operation: impl Into<String>,
        location: &'static Location<'static>,
        source: sqlx::Error,
    ) -> Self {
        Self::Driver {
            operation: operation.into(),
            location,
            source,
        }
    }

    /// Create a lifecycle error.
    pub fn lifecycle(message: impl Into<String>) -> Self {
        Self::Lifecycle {
            message: message.into(),
        }
    }

    /// Check whether this error is routine advisory-lock contention.
    pub fn is_lock_busy(&self) -> bool {
        matches!(self, Self::LockBusy { .. })
    }

    /// Get the underlying driver error, if any.
    pub fn driver_source(&self) -> Option<&sqlx::Error> {
        match self {
            Self::Driver { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convert bare sqlx errors to PgClientError.
///
/// Used for incidental conversions where no proxy context is available; the
/// tracked execution path always attaches its own operation and call site via
/// [`PgClientError::driver`].
impl From<sqlx::Error> for PgClientError {
    #[track_caller]
    fn from(err: sqlx::Error) -> Self {
        Self::Driver {
            operation: "driver call".to_string(),
            location: Location::caller(),
            source: err,
        }
    }
}

/// Result type alias for client operations.
pub type PgResult<T> = Result<T, PgClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PgClientError::validation("channel name contains '-'");
        assert!(err.to_string().contains("Validation failed"));
    }

    #[test]
    fn test_lock_busy_predicate() {
        assert!(PgClientError::lock_busy("jobs").is_lock_busy());
        assert!(!PgClientError::validation("nope").is_lock_busy());
        assert!(!PgClientError::lifecycle("already started").is_lock_busy());
    }

    #[test]
    fn test_driver_error_carries_call_site() {
        let err = PgClientError::from(sqlx::Error::PoolClosed);
        match err {
            PgClientError::Driver { location, .. } => {
                assert!(location.file().ends_with("error.rs"));
            }
            other => panic!("expected driver error, got {other:?}"),
        }
    }

    #[test]
    fn test_driver_source_accessor() {
        let err = PgClientError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(
            err.driver_source(),
            Some(sqlx::Error::PoolTimedOut)
        ));
        assert!(PgClientError::lock_busy("k").driver_source().is_none());
    }
}
