use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::{AppId, BackendRecord, BackendState, BackendStore, StoreError};

const RECORD_EXT: &str = "toml";

/// Record store keeping one TOML file per app under a directory.
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, app_id: &AppId) -> PathBuf {
        self.dir.join(format!("{app_id}.{RECORD_EXT}"))
    }

    async fn read_record(path: &Path) -> Result<Option<BackendRecord>, StoreError> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };

        toml::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::corrupt(path, e.to_string()))
    }

    async fn write_record(&self, record: &BackendRecord) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?;

        let path = self.record_path(&record.app_id);
        let tmp = path.with_extension(format!("{RECORD_EXT}.tmp"));
        let content = toml::to_string_pretty(record)
            .map_err(|e| StoreError::corrupt(&path, e.to_string()))?;

        fs::write(&tmp, content)
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        debug!(app_id = %record.app_id, state = %record.backend_state, "Record written");
        Ok(())
    }
}

#[async_trait]
impl BackendStore for FileStore {
    async fn load(&self, app_id: &AppId) -> Result<Option<BackendRecord>, StoreError> {
        Self::read_record(&self.record_path(app_id)).await
    }

    async fn save(&self, record: &BackendRecord) -> Result<(), StoreError> {
        self.write_record(record).await
    }

    async fn update_state(
        &self,
        app_id: &AppId,
        state: BackendState,
        port: Option<u16>,
    ) -> Result<(), StoreError> {
        let mut record = self
            .load(app_id)
            .await?
            .ok_or_else(|| StoreError::not_found(app_id.as_str()))?;
        record.apply_state(state, port);
        self.write_record(&record).await
    }

    async fn reset_active(&self) -> Result<usize, StoreError> {
        let mut reset = 0;
        for mut record in self.list().await? {
            if record.backend_state.is_active() || record.backend_port.is_some() {
                record.apply_state(BackendState::Stopped, None);
                self.write_record(&record).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn list(&self) -> Result<Vec<BackendRecord>, StoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        records.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        Ok(records)
    }
}
