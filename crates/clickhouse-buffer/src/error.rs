//! Buffer Error Types
//!
//! This module defines all error types that can occur while buffering,
//! staging and loading rows.
//!
//! ## Error Categories
//!
//! ### Staging Errors
//! - `Staging`: Writing a segment file to the staging directory failed.
//!   Fatal for that flush; the rows are returned to memory and the error is
//!   surfaced to whoever triggered the flush.
//!
//! ### Load Errors
//! - `Load`: The store client rejected or failed the insert. Loads are
//!   retried with backoff; once retries are exhausted this error is surfaced
//!   and the segment files stay on disk.
//!
//! ### Everything Else
//! - `Io`: Filesystem failures outside staging (listing, opening segments)
//! - `Config`: Invalid buffer or client configuration
//! - `Serialization`: Row could not be encoded as JSON
//! - `UnknownCompression`: Unrecognized codec tag
//! - `Closed`: The buffer was already released
//!
//! Failed cleanup after a committed load is deliberately not an error
//! variant: it is logged and swallowed.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Staging write failed: {0}")]
    Staging(#[source] std::io::Error),

    #[error("Load failed: {0}")]
    Load(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown compression format: {0}")]
    UnknownCompression(String),

    #[error("Buffer is released")]
    Closed,
}

impl Error {
    /// Whether a load that failed with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Load(_) | Error::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_display_contains(err: &Error, expected: &str) {
        let msg = format!("{}", err);
        assert!(
            msg.contains(expected),
            "Expected display '{}' to contain '{}'",
            msg,
            expected
        );
    }

    #[test]
    fn test_staging_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let err = Error::Staging(io_err);
        assert_display_contains(&err, "Staging write failed");
        assert_display_contains(&err, "read-only fs");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_load_error_display() {
        let err = Error::Load("Code: 60. Table default.events does not exist".to_string());
        assert_display_contains(&err, "Load failed");
        assert_display_contains(&err, "Code: 60");
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: Error = json_err.into();
        assert_display_contains(&err, "Serialization error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Load("timeout".to_string()).is_transient());
        assert!(Error::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")).is_transient());
        assert!(!Error::Config("bad".to_string()).is_transient());
        assert!(!Error::Closed.is_transient());
        assert!(!Error::UnknownCompression("lzma".to_string()).is_transient());
    }
}
