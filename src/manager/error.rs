//! Errors surfaced by the backend manager API.

use std::path::PathBuf;

use crate::sandbox::LaunchError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// No durable record exists for the app.
    #[error("App not found: {app_id}")]
    AppNotFound { app_id: String },

    /// A live process still owns the app's storage.
    #[error("Storage of app {app_id} is in use by a running backend")]
    StorageBusy { app_id: String },

    /// Removing the storage file failed.
    #[error("Failed to clear storage at {path}: {source}")]
    ClearStorage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Launch(#[from] LaunchError),
}

impl ManagerError {
    /// Creates an `AppNotFound` error.
    pub fn app_not_found(app_id: impl Into<String>) -> Self {
        Self::AppNotFound {
            app_id: app_id.into(),
        }
    }

    /// Creates a `StorageBusy` error.
    pub fn storage_busy(app_id: impl Into<String>) -> Self {
        Self::StorageBusy {
            app_id: app_id.into(),
        }
    }

    /// Returns true if the app is unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::AppNotFound { .. })
    }

    /// Returns true if the runtime could not be spawned.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, Self::Launch(e) if e.is_spawn_failure())
    }
}
