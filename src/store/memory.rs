//! In-memory record store for tests, with write-failure injection.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{AppId, BackendRecord, BackendState, BackendStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<AppId, BackendRecord>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a write
    pub fn insert(&self, record: BackendRecord) {
        self.lock().insert(record.app_id.clone(), record);
    }

    /// Seed an app with the given source and state
    pub fn with_app(self, id: &str, source: Option<&str>, state: BackendState) -> Self {
        let app_id: AppId = id.parse().expect("valid test app id");
        let mut record = BackendRecord::new(app_id, source.map(ToString::to_string));
        record.backend_state = state;
        if state == BackendState::Running {
            record.backend_port = Some(9000);
        }
        self.insert(record);
        self
    }

    /// Snapshot of a record, bypassing failure injection
    pub fn get(&self, app_id: &AppId) -> Option<BackendRecord> {
        self.lock().get(app_id).cloned()
    }

    pub fn state_of(&self, app_id: &AppId) -> Option<BackendState> {
        self.get(app_id).map(|record| record.backend_state)
    }

    /// Overwrite the stored state directly, as an outside writer would
    pub fn force_state(&self, app_id: &AppId, state: BackendState, port: Option<u16>) {
        if let Some(record) = self.lock().get_mut(app_id) {
            record.backend_state = state;
            record.backend_port = port;
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<AppId, BackendRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("injected write failure"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BackendStore for MemoryStore {
    async fn load(&self, app_id: &AppId) -> Result<Option<BackendRecord>, StoreError> {
        Ok(self.get(app_id))
    }

    async fn save(&self, record: &BackendRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.insert(record.clone());
        Ok(())
    }

    async fn update_state(
        &self,
        app_id: &AppId,
        state: BackendState,
        port: Option<u16>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut records = self.lock();
        let record = records
            .get_mut(app_id)
            .ok_or_else(|| StoreError::not_found(app_id.as_str()))?;
        record.apply_state(state, port);
        Ok(())
    }

    async fn reset_active(&self) -> Result<usize, StoreError> {
        self.check_writable()?;
        let mut reset = 0;
        for record in self.lock().values_mut() {
            if record.backend_state.is_active() || record.backend_port.is_some() {
                record.apply_state(BackendState::Stopped, None);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn list(&self) -> Result<Vec<BackendRecord>, StoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}
