use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;

use signal_core::AccountSnapshot;

/// Shared, read-mostly view of the latest account snapshot per executor.
/// The monitor worker is the only writer; readers get copies.
#[derive(Default)]
pub struct SnapshotStore {
    snapshots: DashMap<String, AccountSnapshot>,
    notifiers: DashMap<String, Arc<Notify>>,
    degraded: DashMap<String, bool>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, executor_id: &str) -> Option<AccountSnapshot> {
        self.snapshots.get(executor_id).map(|s| s.clone())
    }

    pub fn update(&self, snapshot: AccountSnapshot) {
        self.snapshots.insert(snapshot.executor_id.clone(), snapshot);
    }

    /// Wakeup handle the queue processor waits on; fired after every
    /// change-driven re-evaluation pass.
    pub fn notifier(&self, executor_id: &str) -> Arc<Notify> {
        self.notifiers
            .entry(executor_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, executor_id: &str) {
        self.notifier(executor_id).notify_waiters();
    }

    pub fn set_degraded(&self, executor_id: &str, degraded: bool) {
        self.degraded.insert(executor_id.to_string(), degraded);
    }

    pub fn is_degraded(&self, executor_id: &str) -> bool {
        self.degraded.get(executor_id).map(|d| *d).unwrap_or(false)
    }
}
