use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MAX_APP_ID_LEN: usize = 64;

/// Stable identifier of a generated app.
///
/// Restricted to `[A-Za-z0-9_-]{1,64}` because it names the record file and
/// the storage directory of the app.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppIdError {
    #[error("App id must not be empty")]
    Empty,

    #[error("App id is longer than 64 characters")]
    TooLong,

    #[error("App id contains invalid character {0:?} (allowed: letters, digits, '-', '_')")]
    InvalidChar(char),
}

impl AppId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AppId {
    type Err = AppIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AppIdError::Empty);
        }
        if s.len() > MAX_APP_ID_LEN {
            return Err(AppIdError::TooLong);
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(AppIdError::InvalidChar(bad));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for AppId {
    type Error = AppIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> Self {
        id.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Declared lifecycle state of an app backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    FailedToStart,
}

impl BackendState {
    /// States that claim a live process exists.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    /// States a new start may begin from.
    pub fn is_startable(self) -> bool {
        matches!(self, Self::Stopped | Self::FailedToStart)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::FailedToStart => "FAILED_TO_START",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend portion of an app's durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRecord {
    pub app_id: AppId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_source_code: Option<String>,

    #[serde(default)]
    pub backend_state: BackendState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_connection_url: Option<String>,

    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl BackendRecord {
    pub fn new(app_id: AppId, backend_source_code: Option<String>) -> Self {
        Self {
            app_id,
            backend_source_code,
            backend_state: BackendState::Stopped,
            backend_port: None,
            wallet_connection_url: None,
            updated_at: Utc::now(),
        }
    }

    /// Source code, if the app declares a non-blank backend
    pub fn backend_source(&self) -> Option<&str> {
        self.backend_source_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
    }

    pub fn has_backend(&self) -> bool {
        self.backend_source().is_some()
    }

    /// Record a state transition. A port is only kept alongside RUNNING.
    pub fn apply_state(&mut self, state: BackendState, port: Option<u16>) {
        self.backend_state = state;
        self.backend_port = if state == BackendState::Running {
            port
        } else {
            None
        };
        self.updated_at = Utc::now();
    }

    /// Whether the record breaks the port/state pairing
    pub fn port_mismatch(&self) -> bool {
        self.backend_port.is_some() != (self.backend_state == BackendState::Running)
    }
}
