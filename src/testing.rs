//! Shared fixtures for unit tests.
//!
//! Backends are run through a tiny shell script standing in for the JS
//! runtime: it ignores the permission flags and executes the materialized
//! source file with `/bin/sh`, so test "source code" is plain shell.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crate::config::Config;
use crate::manager::{BackendManager, BackendStatus};
use crate::store::{AppId, BackendState, BackendStore, MemoryStore};

/// Stays alive until killed and never mentions its port.
pub const SLEEPING_BACKEND: &str = "exec sleep 30\n";

/// Announces the port the way generated backends do, then idles.
pub const ANNOUNCING_BACKEND: &str = "echo \"Deno server running on port $PORT\"\nexec sleep 30\n";

/// Dies immediately with a non-zero code.
pub const CRASHING_BACKEND: &str = "echo 'boom' >&2\nexit 3\n";

/// Ignores SIGTERM, so only SIGKILL gets rid of it.
pub const STUBBORN_BACKEND: &str = "trap '' TERM\nwhile :; do sleep 1; done\n";

const FAKE_RUNTIME: &str = "for last in \"$@\"; do :; done\nexec /bin/sh \"$last\"\n";

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let runtime = dir.path().join("fake-runtime.sh");
        std::fs::write(&runtime, FAKE_RUNTIME).unwrap();

        let mut config = Config::default();
        // Run the script through sh instead of exec'ing a freshly written file
        config.runtime.command =
            shell_words::join(["/bin/sh", runtime.to_str().unwrap(), "run"]);
        config.runtime.passthrough_env = vec!["PATH".to_string()];
        config.paths.work_dir = dir.path().join("work");
        config.paths.scratch_dir = Some(dir.path().join("scratch"));
        config.ports.verify_free = false;
        config.lifecycle.startup_grace_ms = 150;
        config.lifecycle.stop_grace_ms = 1_000;
        config.lifecycle.inactivity_timeout_secs = 600;
        config.lifecycle.ready_on_port_log = false;

        Self { dir, config }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.config.paths.scratch_dir()
    }

    pub fn manager(&self, store: Arc<MemoryStore>) -> BackendManager {
        let store: Arc<dyn BackendStore> = store;
        BackendManager::new(&self.config, store).unwrap()
    }
}

pub fn app_id(id: &str) -> AppId {
    id.parse().unwrap()
}

/// Files currently in a directory (empty if it does not exist)
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}

/// Poll the reconciled status until it reaches `state`.
pub async fn wait_for_state(
    manager: &BackendManager,
    app_id: &AppId,
    state: BackendState,
    timeout: Duration,
) -> BackendStatus {
    let deadline = Instant::now() + timeout;
    loop {
        let status = manager.get_backend_status(app_id).await.unwrap();
        if status.state == state {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "app {app_id} stuck in {} waiting for {state}",
            status.state
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until nothing is tracked for the app.
pub async fn wait_until_untracked(manager: &BackendManager, app_id: &AppId, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while manager.is_tracked(app_id) {
        assert!(Instant::now() < deadline, "app {app_id} still tracked");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
