//! Durable app backend records.
//!
//! The manager only ever touches the backend fields of an app's record:
//! source code, declared state, port and wallet URL. [`BackendStore`] is the
//! seam between the lifecycle logic and whatever persists those fields.

mod error;
mod file;
#[cfg(test)]
mod memory;
mod record;

use async_trait::async_trait;

pub use error::StoreError;
pub use file::FileStore;
#[cfg(test)]
pub use memory::MemoryStore;
pub use record::{AppId, BackendRecord, BackendState};

/// Persistence collaborator for backend records.
#[async_trait]
pub trait BackendStore: Send + Sync {
    /// Fetch a record, `None` if the app is unknown.
    async fn load(&self, app_id: &AppId) -> Result<Option<BackendRecord>, StoreError>;

    /// Insert or replace a record.
    async fn save(&self, record: &BackendRecord) -> Result<(), StoreError>;

    /// Write a state transition. The port is dropped unless `state` is RUNNING.
    async fn update_state(
        &self,
        app_id: &AppId,
        state: BackendState,
        port: Option<u16>,
    ) -> Result<(), StoreError>;

    /// Force every STARTING/RUNNING/STOPPING record back to STOPPED.
    /// Returns the number of records changed.
    async fn reset_active(&self) -> Result<usize, StoreError>;

    /// All records, ordered by app id.
    async fn list(&self) -> Result<Vec<BackendRecord>, StoreError>;
}
