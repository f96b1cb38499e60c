//! Fire-and-forget start intents.
//!
//! The ingress path must never wait on a cold start. It drops an intent on
//! the queue and answers right away; a worker task turns intents into
//! `start_backend` calls.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::WeakManager;
use crate::store::AppId;

#[derive(Debug, Clone)]
pub struct StartQueue {
    tx: mpsc::UnboundedSender<AppId>,
}

impl StartQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AppId>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a start. False if the worker is gone.
    pub fn push(&self, app_id: AppId) -> bool {
        self.tx.send(app_id).is_ok()
    }
}

/// Drain intents until the manager is dropped. Each start runs in its own
/// task so one slow spawn does not hold up other apps; duplicates for the
/// same app are absorbed by the per-app lock and the registry check.
pub fn spawn_worker(manager: WeakManager, mut rx: mpsc::UnboundedReceiver<AppId>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(app_id) = rx.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            debug!(app_id = %app_id, "Processing queued start");
            tokio::spawn(async move {
                if let Err(e) = manager.start_backend(&app_id).await {
                    warn!(app_id = %app_id, error = %e, "Queued start failed");
                }
            });
        }
        debug!("Start queue closed");
    })
}
