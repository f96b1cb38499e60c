//! Domain-specific error types for launching sandboxed backends.
//!
//! Typed errors let the lifecycle code tell a bad configuration apart from
//! an OS spawn failure without parsing message strings.

use std::path::PathBuf;

/// Errors that can occur while preparing or spawning a backend process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The runtime command or memory limit in the config is unusable.
    #[error("Invalid runtime configuration: {message}")]
    InvalidRuntime { message: String },

    /// Writing the backend source to its scratch file failed.
    #[error("Failed to materialize backend source at {path}: {source}")]
    Materialize {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Creating the per-app storage directory failed.
    #[error("Failed to prepare storage directory {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No usable port is left.
    #[error("No free port available (last candidate {last_candidate})")]
    PortsExhausted { last_candidate: u32 },

    /// The OS refused to start the runtime.
    #[error("Failed to spawn runtime '{program}': {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    /// Creates an `InvalidRuntime` error.
    pub fn invalid_runtime(message: impl Into<String>) -> Self {
        Self::InvalidRuntime {
            message: message.into(),
        }
    }

    /// Creates a `Materialize` error.
    pub fn materialize(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Materialize {
            path: path.into(),
            source,
        }
    }

    /// Creates a `Storage` error.
    pub fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Creates a `PortsExhausted` error.
    pub fn ports_exhausted(last_candidate: u32) -> Self {
        Self::PortsExhausted { last_candidate }
    }

    /// Creates a `SpawnFailed` error.
    pub fn spawn_failed(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            program: program.into(),
            source,
        }
    }

    /// Returns true if the runtime process could not be started by the OS.
    pub fn is_spawn_failure(&self) -> bool {
        matches!(self, Self::SpawnFailed { .. })
    }

    /// Returns true if the port space is used up.
    pub fn is_ports_exhausted(&self) -> bool {
        matches!(self, Self::PortsExhausted { .. })
    }
}
