//! Idle timers for running backends.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::WeakManager;
use crate::store::AppId;

/// Spawn a timer that stops the app after `timeout` unless it is replaced
/// first. The task only holds a weak handle, so a pending timer never keeps
/// the manager alive.
pub fn schedule_idle_stop(
    manager: WeakManager,
    app_id: AppId,
    generation: u64,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;

        let Some(manager) = manager.upgrade() else {
            return;
        };
        if !manager.is_idle_target(&app_id, generation) {
            debug!(app_id = %app_id, generation, "Idle timer fired for a process that is gone");
            return;
        }

        info!(
            event = "backend_idle_timeout",
            app_id = %app_id,
            idle_secs = timeout.as_secs(),
            "Inactivity timeout reached, stopping backend"
        );
        // The stop cancels this timer, so it runs in its own task
        manager.detach_idle_timer(&app_id, generation);
        tokio::spawn(async move {
            if let Err(e) = manager.stop_backend(&app_id).await {
                warn!(app_id = %app_id, error = %e, "Idle stop failed");
            }
        });
    })
}
