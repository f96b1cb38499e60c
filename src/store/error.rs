//! Errors raised by durable record stores.

use std::path::PathBuf;

/// Errors that can occur while reading or writing backend records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record exists for the app.
    #[error("Backend record not found: {app_id}")]
    NotFound { app_id: String },

    /// Filesystem operation on the record store failed.
    #[error("Record store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record file exists but does not parse.
    #[error("Failed to parse record {path}: {message}")]
    Corrupt { path: PathBuf, message: String },

    /// The store refused or could not complete the write.
    #[error("Record store unavailable: {message}")]
    Unavailable { message: String },
}

impl StoreError {
    /// Creates a `NotFound` error.
    pub fn not_found(app_id: impl Into<String>) -> Self {
        Self::NotFound {
            app_id: app_id.into(),
        }
    }

    /// Creates an `Io` error for a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a `Corrupt` error.
    pub fn corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates an `Unavailable` error.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Returns true if the record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_error() {
        let err = StoreError::not_found("app-1");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "Backend record not found: app-1");
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = StoreError::io(
            "/data/records/app.toml",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_not_found());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("/data/records/app.toml"));
    }

    #[test]
    fn test_unavailable_error() {
        let err = StoreError::unavailable("disk full");
        assert_eq!(err.to_string(), "Record store unavailable: disk full");
    }
}
