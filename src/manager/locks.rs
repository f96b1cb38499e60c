use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::store::AppId;

type AppMutex = Arc<AsyncMutex<()>>;

/// One async mutex per app. Every lifecycle transition of an app runs
/// while holding its lock, so transitions of one app never interleave.
///
/// Entries only live while someone holds or waits for them; the last guard
/// to drop removes its app from the table.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashMap<AppId, AppMutex>>,
}

/// Held lock of one app. Releasing it may evict the app's table entry.
#[derive(Debug)]
pub struct AppLockGuard<'a> {
    table: &'a LockTable,
    app_id: AppId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, app_id: &AppId) -> AppLockGuard<'_> {
        let lock = self.entries().entry(app_id.clone()).or_default().clone();
        AppLockGuard {
            table: self,
            app_id: app_id.clone(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Number of apps with a held or awaited lock
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<AppId, AppMutex>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for AppLockGuard<'_> {
    fn drop(&mut self) {
        // Waiters clone the mutex under the table lock, so with the table
        // lock held a count of one means the map holds the only reference.
        let mut entries = self.table.entries();
        drop(self.guard.take());
        if entries
            .get(&self.app_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            entries.remove(&self.app_id);
        }
    }
}
