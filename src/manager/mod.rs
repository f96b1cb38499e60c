//! Backend lifecycle manager.
//!
//! Drives each app's backend through
//! `STOPPED -> STARTING -> RUNNING -> STOPPING -> STOPPED` (or
//! `FAILED_TO_START`), keeping the in-memory process registry and the durable
//! record in agreement.
//!
//! Every transition for an app runs under that app's lock (see
//! [`locks::LockTable`]). Slow work such as the startup grace period and
//! waiting for a terminated process happens outside the lock in spawned
//! tasks, which re-take the lock and check the entry's generation before
//! acting.

mod error;
mod locks;
mod queue;
mod reaper;
mod registry;
mod supervisor;

use futures_util::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

pub use error::ManagerError;
pub use registry::{EntrySnapshot, Phase};
pub use supervisor::ExitReport;

use locks::LockTable;
use queue::StartQueue;
use registry::{ProcessRegistry, RunningEntry};
use supervisor::ControlSignal;

use crate::config::{Config, LifecycleConfig};
use crate::sandbox::{remove_artifact, LaunchError, LaunchRequest, Launcher};
use crate::store::{AppId, BackendRecord, BackendState, BackendStore};

/// Timing knobs of the state machine
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub startup_grace: Duration,
    pub stop_grace: Duration,
    pub inactivity_timeout: Duration,
    pub ready_on_port_log: bool,
}

impl From<&LifecycleConfig> for LifecycleSettings {
    fn from(config: &LifecycleConfig) -> Self {
        Self {
            startup_grace: config.startup_grace(),
            stop_grace: config.stop_grace(),
            inactivity_timeout: config.inactivity_timeout(),
            ready_on_port_log: config.ready_on_port_log,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A process was spawned and is in its startup grace period.
    Starting { port: u16 },
    /// A process for this app is already tracked.
    AlreadyTracked,
    /// The app declares no backend code.
    NoBackend,
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// A tracked process was terminated; `exit` is `None` if even SIGKILL
    /// did not produce an exit within the grace window.
    Stopped { exit: Option<ExitReport> },
    /// Nothing was running; the durable state was reconciled to STOPPED.
    NotRunning,
}

/// Reconciled view of an app's backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStatus {
    pub state: BackendState,
    pub port: Option<u16>,
    pub has_backend: bool,
}

impl From<&BackendRecord> for BackendStatus {
    fn from(record: &BackendRecord) -> Self {
        Self {
            state: record.backend_state,
            port: record.backend_port.filter(|_| record.backend_state == BackendState::Running),
            has_backend: record.has_backend(),
        }
    }
}

struct Inner {
    store: Arc<dyn BackendStore>,
    launcher: Launcher,
    registry: ProcessRegistry,
    locks: LockTable,
    settings: LifecycleSettings,
    default_nwc_url: Option<String>,
    generations: AtomicU64,
    start_queue: StartQueue,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct BackendManager {
    inner: Arc<Inner>,
}

/// Non-owning handle used by timers and the start worker.
#[derive(Clone)]
pub struct WeakManager(Weak<Inner>);

impl WeakManager {
    pub fn upgrade(&self) -> Option<BackendManager> {
        self.0.upgrade().map(|inner| BackendManager { inner })
    }
}

impl BackendManager {
    /// Build a manager and start its queue worker. Must be called inside a
    /// tokio runtime.
    pub fn new(config: &Config, store: Arc<dyn BackendStore>) -> Result<Self, LaunchError> {
        let launcher = Launcher::from_config(config)?;
        let (start_queue, intents) = StartQueue::new();

        let manager = Self {
            inner: Arc::new(Inner {
                store,
                launcher,
                registry: ProcessRegistry::new(),
                locks: LockTable::new(),
                settings: LifecycleSettings::from(&config.lifecycle),
                default_nwc_url: config.wallet.default_nwc_url.clone(),
                generations: AtomicU64::new(0),
                start_queue,
            }),
        };
        queue::spawn_worker(manager.downgrade(), intents);
        Ok(manager)
    }

    pub fn downgrade(&self) -> WeakManager {
        WeakManager(Arc::downgrade(&self.inner))
    }

    // ----- Public API -----

    /// Reset records left active by a previous run. Nothing survives a
    /// restart, so any STARTING/RUNNING/STOPPING record is stale.
    pub async fn initialize(&self) -> Result<usize, ManagerError> {
        info!("Initializing backend manager: resetting stale backend states");
        let reset = self.inner.store.reset_active().await?;
        info!(
            event = "manager_initialized",
            reset,
            "Reset {reset} backend records to STOPPED"
        );
        Ok(reset)
    }

    /// Start the app's backend if it is not already tracked.
    ///
    /// Returns once the process is spawned; promotion to RUNNING happens
    /// after the startup grace period in a background task.
    pub async fn start_backend(&self, app_id: &AppId) -> Result<StartOutcome, ManagerError> {
        let _guard = self.inner.locks.lock(app_id).await;
        info!(app_id = %app_id, "Attempting to start backend");

        if self.inner.registry.contains(app_id) {
            debug!(app_id = %app_id, "Backend already tracked, ignoring start");
            return Ok(StartOutcome::AlreadyTracked);
        }

        let record = self.load_record(app_id).await?;
        let Some(source) = record.backend_source() else {
            info!(app_id = %app_id, "App has no backend code, nothing to start");
            return Ok(StartOutcome::NoBackend);
        };

        if !record.backend_state.is_startable() {
            warn!(
                app_id = %app_id,
                state = %record.backend_state,
                "Durable state claims a live process that is not tracked, resetting"
            );
            self.inner
                .store
                .update_state(app_id, BackendState::Stopped, None)
                .await?;
        }

        self.inner
            .store
            .update_state(app_id, BackendState::Starting, None)
            .await?;

        let nwc_url = record
            .wallet_connection_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .or(self.inner.default_nwc_url.as_deref());
        let request = LaunchRequest {
            app_id,
            source_code: source,
            nwc_url,
        };

        let launched = match self.inner.launcher.launch(request).await {
            Ok(launched) => launched,
            Err(e) => {
                error!(
                    event = "backend_spawn_failed",
                    app_id = %app_id,
                    error = %e,
                    "Failed to launch backend"
                );
                if e.is_ports_exhausted() {
                    warn!("No free backend ports left; raise ports.max_attempts or lower ports.base");
                }
                self.write_state_logged(app_id, BackendState::FailedToStart, None)
                    .await;
                return Err(e.into());
            }
        };

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let port = launched.port;
        let pid = launched.pid;

        let exit_handle = self.downgrade();
        let exit_app = app_id.clone();
        let supervision = supervisor::supervise(
            app_id.clone(),
            launched.child,
            port,
            self.inner.settings.ready_on_port_log,
            move |report| async move {
                if let Some(manager) = exit_handle.upgrade() {
                    manager.handle_exit(&exit_app, generation, report).await;
                }
            },
        );

        let entry = RunningEntry::new(
            generation,
            pid,
            port,
            launched.source_path,
            launched.storage_path,
            supervision.control,
            supervision.exited.clone(),
        );
        if let Err(entry) = self.inner.registry.insert(app_id.clone(), entry) {
            // Unreachable while the app lock is held, but never leak a process
            entry.signal(ControlSignal::Kill);
            return Ok(StartOutcome::AlreadyTracked);
        }

        info!(
            event = "backend_spawned",
            app_id = %app_id,
            pid,
            port,
            generation,
            "Backend process spawned"
        );

        self.spawn_startup_watch(
            app_id.clone(),
            generation,
            port,
            supervision.exited,
            supervision.ready,
        );
        Ok(StartOutcome::Starting { port })
    }

    /// Terminate the app's backend: SIGTERM, then SIGKILL after the stop
    /// grace period. Returns once the exit is confirmed.
    pub async fn stop_backend(&self, app_id: &AppId) -> Result<StopOutcome, ManagerError> {
        let (generation, mut exited) = {
            let _guard = self.inner.locks.lock(app_id).await;
            info!(app_id = %app_id, "Attempting to stop backend");

            let Some(entry) = self.inner.registry.get(app_id) else {
                self.reconcile_untracked_stop(app_id).await?;
                return Ok(StopOutcome::NotRunning);
            };

            let already_stopping = self
                .inner
                .registry
                .begin_stop(app_id, entry.generation)
                .unwrap_or(true);

            match self.inner.store.load(app_id).await {
                Ok(Some(record))
                    if matches!(
                        record.backend_state,
                        BackendState::Running | BackendState::Starting
                    ) =>
                {
                    self.write_state_logged(app_id, BackendState::Stopping, None)
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(app_id = %app_id, error = %e, "Failed to read record before stop"),
            }

            if !already_stopping {
                self.inner.registry.signal(app_id, ControlSignal::Terminate);
                info!(
                    event = "backend_stopping",
                    app_id = %app_id,
                    pid = entry.pid,
                    "Sent SIGTERM to backend"
                );
            }

            let Some(exited) = self.inner.registry.exit_watch(app_id) else {
                return Ok(StopOutcome::NotRunning);
            };
            (entry.generation, exited)
        };

        let exit = self.await_exit(app_id, generation, &mut exited).await;
        Ok(StopOutcome::Stopped { exit })
    }

    /// Current state, reconciled against the registry.
    ///
    /// Repairs two kinds of drift on the way: an active durable state with
    /// no tracked process is reset to STOPPED, and a tracked process whose
    /// record says STOPPED or FAILED_TO_START is removed and killed.
    pub async fn get_backend_status(&self, app_id: &AppId) -> Result<BackendStatus, ManagerError> {
        let _guard = self.inner.locks.lock(app_id).await;
        let record = self.load_record(app_id).await?;
        let tracked = self.inner.registry.get(app_id);
        let state = record.backend_state;

        match tracked {
            None if state.is_active() || record.port_mismatch() => {
                let repaired = if state.is_active() {
                    BackendState::Stopped
                } else {
                    state
                };
                warn!(
                    app_id = %app_id,
                    state = %state,
                    repaired = %repaired,
                    "Durable state claims a live backend but none is tracked, repairing"
                );
                self.write_state_logged(app_id, repaired, None).await;
                Ok(BackendStatus {
                    state: repaired,
                    port: None,
                    has_backend: record.has_backend(),
                })
            }
            Some(entry) if !state.is_active() => {
                warn!(
                    app_id = %app_id,
                    state = %state,
                    pid = entry.pid,
                    "Tracked process contradicts durable state, removing stale entry"
                );
                if let Some(stale) = self.inner.registry.remove(app_id, entry.generation) {
                    stale.signal(ControlSignal::Kill);
                    remove_artifact(&stale.source_path).await;
                }
                if record.port_mismatch() {
                    self.write_state_logged(app_id, state, None).await;
                }
                Ok(BackendStatus {
                    state,
                    port: None,
                    has_backend: record.has_backend(),
                })
            }
            Some(entry)
                if state == BackendState::Running && record.backend_port != Some(entry.port) =>
            {
                warn!(app_id = %app_id, port = entry.port, "Durable port out of date, repairing");
                self.write_state_logged(app_id, BackendState::Running, Some(entry.port))
                    .await;
                Ok(BackendStatus {
                    state,
                    port: Some(entry.port),
                    has_backend: record.has_backend(),
                })
            }
            _ => Ok(BackendStatus::from(&record)),
        }
    }

    /// Remove the app's storage file. Refused while a process is tracked.
    /// Returns whether a file was removed.
    pub async fn clear_storage(&self, app_id: &AppId) -> Result<bool, ManagerError> {
        let _guard = self.inner.locks.lock(app_id).await;
        self.load_record(app_id).await?;

        if self.inner.registry.contains(app_id) {
            return Err(ManagerError::storage_busy(app_id.as_str()));
        }

        let path = self.inner.launcher.storage_path(app_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(app_id = %app_id, path = %path.display(), "Cleared backend storage");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ManagerError::ClearStorage { path, source }),
        }
    }

    /// Push back the idle deadline of a running backend. False if the app
    /// is not running.
    pub fn reset_inactivity_timer(&self, app_id: &AppId) -> bool {
        let Some(entry) = self.inner.registry.get(app_id) else {
            return false;
        };
        if entry.phase != Phase::Running {
            return false;
        }
        self.inner.registry.touch(app_id);
        self.schedule_idle_stop(app_id, entry.generation);
        true
    }

    /// Queue a start without waiting for it.
    pub fn request_start(&self, app_id: &AppId) -> bool {
        debug!(app_id = %app_id, "Queueing backend start");
        self.inner.start_queue.push(app_id.clone())
    }

    /// Stop every tracked backend concurrently.
    pub async fn stop_all(&self) {
        let app_ids = self.inner.registry.app_ids();
        if app_ids.is_empty() {
            return;
        }
        info!(count = app_ids.len(), "Stopping all managed backends");

        let results = join_all(app_ids.iter().map(|app_id| self.stop_backend(app_id))).await;
        for (app_id, result) in app_ids.iter().zip(results) {
            if let Err(e) = result {
                error!(app_id = %app_id, error = %e, "Failed to stop backend during shutdown");
            }
        }
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_tracked(&self, app_id: &AppId) -> bool {
        self.inner.registry.contains(app_id)
    }

    pub fn tracked(&self, app_id: &AppId) -> Option<EntrySnapshot> {
        self.inner.registry.get(app_id)
    }

    // ----- Transitions driven by background tasks -----

    fn spawn_startup_watch(
        &self,
        app_id: AppId,
        generation: u64,
        port: u16,
        mut exited: watch::Receiver<Option<ExitReport>>,
        ready: oneshot::Receiver<()>,
    ) {
        let manager = self.clone();
        let grace = self.inner.settings.startup_grace;

        tokio::spawn(async move {
            let ready = async {
                if ready.await.is_err() {
                    std::future::pending::<()>().await;
                }
            };

            tokio::select! {
                () = tokio::time::sleep(grace) => {}
                () = ready => {
                    debug!(app_id = %app_id, port, "Readiness line seen before grace expired");
                }
                _ = exited.wait_for(Option::is_some) => return,
            }

            manager.promote_to_running(&app_id, generation, port).await;
        });
    }

    async fn promote_to_running(&self, app_id: &AppId, generation: u64, port: u16) {
        let guard = self.inner.locks.lock(app_id).await;

        let promoted = self
            .inner
            .registry
            .update(app_id, generation, |entry| {
                if entry.phase != Phase::Starting {
                    return false;
                }
                entry.phase = Phase::Running;
                entry.last_activity = chrono::Utc::now();
                true
            })
            .unwrap_or(false);
        if !promoted {
            debug!(app_id = %app_id, generation, "Startup finished for a process no longer starting");
            return;
        }

        match self
            .inner
            .store
            .update_state(app_id, BackendState::Running, Some(port))
            .await
        {
            Ok(()) => {
                info!(
                    event = "backend_running",
                    app_id = %app_id,
                    port,
                    "Backend is running"
                );
                self.schedule_idle_stop(app_id, generation);
            }
            Err(e) => {
                error!(
                    app_id = %app_id,
                    error = %e,
                    "Failed to record RUNNING state, stopping backend"
                );
                drop(guard);
                if let Err(e) = self.stop_backend(app_id).await {
                    error!(app_id = %app_id, error = %e, "Failed to stop unrecorded backend");
                }
            }
        }
    }

    async fn handle_exit(&self, app_id: &AppId, generation: u64, report: ExitReport) {
        let _guard = self.inner.locks.lock(app_id).await;

        let Some(entry) = self.inner.registry.remove(app_id, generation) else {
            debug!(app_id = %app_id, generation, "Exit of an untracked process, ignoring");
            return;
        };
        remove_artifact(&entry.source_path).await;

        let state = report.final_state(entry.stop_requested);
        let exit = report.describe();
        match (state, entry.phase) {
            (BackendState::FailedToStart, Phase::Starting) => error!(
                event = "backend_startup_failed",
                app_id = %app_id,
                exit = %exit,
                "Backend {exit} during startup"
            ),
            (BackendState::FailedToStart, _) => error!(
                event = "backend_crashed",
                app_id = %app_id,
                exit = %exit,
                "Backend {exit} unexpectedly"
            ),
            _ => info!(
                event = "backend_stopped",
                app_id = %app_id,
                exit = %exit,
                "Backend stopped"
            ),
        }

        self.write_state_logged(app_id, state, None).await;
    }

    // ----- Helpers -----

    async fn load_record(&self, app_id: &AppId) -> Result<BackendRecord, ManagerError> {
        self.inner
            .store
            .load(app_id)
            .await?
            .ok_or_else(|| ManagerError::app_not_found(app_id.as_str()))
    }

    /// Write a state, logging instead of failing. The next status read
    /// repairs anything left behind.
    async fn write_state_logged(&self, app_id: &AppId, state: BackendState, port: Option<u16>) {
        match self.inner.store.update_state(app_id, state, port).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => warn!(
                app_id = %app_id,
                state = %state,
                "App record disappeared, state not written"
            ),
            Err(e) => error!(
                app_id = %app_id,
                state = %state,
                error = %e,
                "Failed to write backend state"
            ),
        }
    }

    async fn reconcile_untracked_stop(&self, app_id: &AppId) -> Result<(), ManagerError> {
        let record = self.load_record(app_id).await?;
        if record.backend_state.is_active() {
            warn!(
                app_id = %app_id,
                state = %record.backend_state,
                "No tracked process to stop, forcing STOPPED"
            );
            self.inner
                .store
                .update_state(app_id, BackendState::Stopped, None)
                .await?;
        } else {
            debug!(app_id = %app_id, "Backend not running, nothing to stop");
        }
        Ok(())
    }

    async fn await_exit(
        &self,
        app_id: &AppId,
        generation: u64,
        exited: &mut watch::Receiver<Option<ExitReport>>,
    ) -> Option<ExitReport> {
        let grace = self.inner.settings.stop_grace;

        if let Ok(Ok(report)) = tokio::time::timeout(grace, exited.wait_for(Option::is_some)).await {
            return *report;
        }

        warn!(
            app_id = %app_id,
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "Backend ignored SIGTERM, sending SIGKILL"
        );
        self.inner
            .registry
            .update(app_id, generation, |entry| entry.signal(ControlSignal::Kill));

        match tokio::time::timeout(grace, exited.wait_for(Option::is_some)).await {
            Ok(Ok(report)) => *report,
            _ => {
                error!(app_id = %app_id, "Backend did not exit after SIGKILL");
                None
            }
        }
    }

    fn schedule_idle_stop(&self, app_id: &AppId, generation: u64) {
        let timer = reaper::schedule_idle_stop(
            self.downgrade(),
            app_id.clone(),
            generation,
            self.inner.settings.inactivity_timeout,
        );
        self.inner
            .registry
            .replace_idle_timer(app_id, generation, timer);
    }

    fn is_idle_target(&self, app_id: &AppId, generation: u64) -> bool {
        self.inner
            .registry
            .get(app_id)
            .is_some_and(|entry| entry.generation == generation && entry.phase == Phase::Running)
    }

    fn detach_idle_timer(&self, app_id: &AppId, generation: u64) {
        self.inner.registry.detach_idle_timer(app_id, generation);
    }
}
