//! In-memory table of live backend processes.
//!
//! Never persisted: after a restart it is empty and the durable records are
//! reconciled against it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::supervisor::{ControlSignal, ExitReport};
use crate::store::AppId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stopping,
}

/// A tracked process. Owned by the registry; the OS child itself lives in
/// the supervisor task and is reached through `control`.
#[derive(Debug)]
pub struct RunningEntry {
    pub generation: u64,
    pub pid: Option<u32>,
    pub port: u16,
    pub source_path: PathBuf,
    pub storage_path: PathBuf,
    pub phase: Phase,
    pub stop_requested: bool,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    control: mpsc::UnboundedSender<ControlSignal>,
    exited: watch::Receiver<Option<ExitReport>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl RunningEntry {
    pub fn new(
        generation: u64,
        pid: Option<u32>,
        port: u16,
        source_path: PathBuf,
        storage_path: PathBuf,
        control: mpsc::UnboundedSender<ControlSignal>,
        exited: watch::Receiver<Option<ExitReport>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            generation,
            pid,
            port,
            source_path,
            storage_path,
            phase: Phase::Starting,
            stop_requested: false,
            started_at: now,
            last_activity: now,
            control,
            exited,
            idle_timer: None,
        }
    }

    /// Ask the supervisor to deliver a signal. False if it already exited.
    pub fn signal(&self, signal: ControlSignal) -> bool {
        self.control.send(signal).is_ok()
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            generation: self.generation,
            pid: self.pid,
            port: self.port,
            source_path: self.source_path.clone(),
            phase: self.phase,
            stop_requested: self.stop_requested,
            started_at: self.started_at,
            last_activity: self.last_activity,
            has_idle_timer: self.idle_timer.is_some(),
        }
    }
}

/// Copy of an entry's plain fields, safe to hold across awaits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub generation: u64,
    pub pid: Option<u32>,
    pub port: u16,
    pub source_path: PathBuf,
    pub phase: Phase,
    pub stop_requested: bool,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub has_idle_timer: bool,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<AppId, RunningEntry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AppId, RunningEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry. Hands it back if the app is already tracked.
    pub fn insert(&self, app_id: AppId, entry: RunningEntry) -> Result<(), RunningEntry> {
        let mut entries = self.lock();
        if entries.contains_key(&app_id) {
            return Err(entry);
        }
        entries.insert(app_id, entry);
        Ok(())
    }

    pub fn get(&self, app_id: &AppId) -> Option<EntrySnapshot> {
        self.lock().get(app_id).map(RunningEntry::snapshot)
    }

    pub fn contains(&self, app_id: &AppId) -> bool {
        self.lock().contains_key(app_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn list_all(&self) -> Vec<(AppId, EntrySnapshot)> {
        let mut all: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Remove the entry if it still belongs to `generation`. Its idle timer
    /// is cancelled.
    pub fn remove(&self, app_id: &AppId, generation: u64) -> Option<RunningEntry> {
        let mut entries = self.lock();
        if entries.get(app_id)?.generation != generation {
            return None;
        }
        let mut entry = entries.remove(app_id)?;
        entry.cancel_idle_timer();
        Some(entry)
    }

    /// Mutate the entry of a given generation. `None` if it is gone.
    pub fn update<R>(
        &self,
        app_id: &AppId,
        generation: u64,
        f: impl FnOnce(&mut RunningEntry) -> R,
    ) -> Option<R> {
        let mut entries = self.lock();
        let entry = entries.get_mut(app_id)?;
        (entry.generation == generation).then(|| f(entry))
    }

    /// Record traffic for the app
    pub fn touch(&self, app_id: &AppId) -> bool {
        self.lock()
            .get_mut(app_id)
            .map(|entry| entry.last_activity = Utc::now())
            .is_some()
    }

    pub fn signal(&self, app_id: &AppId, signal: ControlSignal) -> bool {
        self.lock()
            .get(app_id)
            .is_some_and(|entry| entry.signal(signal))
    }

    /// Receiver that resolves once the tracked process has exited
    pub fn exit_watch(&self, app_id: &AppId) -> Option<watch::Receiver<Option<ExitReport>>> {
        self.lock().get(app_id).map(|entry| entry.exited.clone())
    }

    /// Install a new idle timer, aborting the old one. Only a RUNNING entry
    /// of the same generation takes a timer; otherwise `timer` is aborted.
    pub fn replace_idle_timer(&self, app_id: &AppId, generation: u64, timer: JoinHandle<()>) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(app_id) {
            Some(entry) if entry.generation == generation && entry.phase == Phase::Running => {
                entry.cancel_idle_timer();
                entry.idle_timer = Some(timer);
                true
            }
            _ => {
                timer.abort();
                false
            }
        }
    }

    /// Cancel the idle timer and move the entry to STOPPING in one step,
    /// so no timer can be installed in between. Returns whether it was
    /// already stopping, `None` if the generation is gone.
    pub fn begin_stop(&self, app_id: &AppId, generation: u64) -> Option<bool> {
        self.update(app_id, generation, |entry| {
            entry.cancel_idle_timer();
            let was_stopping = entry.phase == Phase::Stopping;
            entry.phase = Phase::Stopping;
            entry.stop_requested = true;
            was_stopping
        })
    }

    /// Forget the idle timer without aborting it (used by the timer itself)
    pub fn detach_idle_timer(&self, app_id: &AppId, generation: u64) {
        self.update(app_id, generation, |entry| entry.idle_timer.take());
    }

    pub fn app_ids(&self) -> Vec<AppId> {
        self.list_all().into_iter().map(|(id, _)| id).collect()
    }
}
