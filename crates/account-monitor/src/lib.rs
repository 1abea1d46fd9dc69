pub mod store;

pub use store::SnapshotStore;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use executor_trait::{ExecutorAccount, ExecutorClient, ExecutorPosition};
use signal_core::{
    AccountSnapshot, ConditionContext, ExecutorConfig, MarketClock, Position, PositionSide,
};
use signal_queue::SignalQueue;

/// Consecutive snapshot failures before an executor is flagged degraded.
const DEGRADED_AFTER_FAILURES: u32 = 3;

/// Samples each executor's account on a fixed cadence and promotes queued
/// signals whose conditions have cleared. One dedicated worker per executor
/// so account APIs are never hammered concurrently.
pub struct AccountMonitor {
    executors: Vec<(ExecutorConfig, Arc<dyn ExecutorClient>)>,
    store: Arc<SnapshotStore>,
    queue: Arc<SignalQueue>,
    clock: MarketClock,
    poll_interval: Duration,
    snapshot_timeout: Duration,
    fetch_failures: dashmap::DashMap<String, u32>,
}

impl AccountMonitor {
    pub fn new(
        executors: Vec<(ExecutorConfig, Arc<dyn ExecutorClient>)>,
        store: Arc<SnapshotStore>,
        queue: Arc<SignalQueue>,
        clock: MarketClock,
        poll_interval: Duration,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            executors,
            store,
            queue,
            clock,
            poll_interval,
            snapshot_timeout,
            fetch_failures: dashmap::DashMap::new(),
        }
    }

    /// Spawn one polling worker per executor. Workers exit when `shutdown`
    /// flips to true.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.executors.len())
            .map(|idx| {
                let monitor = Arc::clone(&self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(monitor.poll_interval);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => {
                                monitor.poll_once(idx).await;
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                })
            })
            .collect()
    }

    /// One sampling pass for one executor: fetch, diff, re-evaluate, notify.
    pub async fn poll_once(&self, executor_idx: usize) {
        let (config, client) = &self.executors[executor_idx];
        let executor_id = config.id.clone();

        // Expiry sweep rides on the polling cadence.
        if let Err(e) = self.queue.expire().await {
            tracing::warn!(error = %e, "queue expiry sweep failed");
        }

        let fetched = tokio::time::timeout(self.snapshot_timeout, async {
            let account = client.account().await?;
            let positions = client.positions().await?;
            Ok::<_, executor_trait::ExecutorError>((account, positions))
        })
        .await;

        let (account, positions) = match fetched {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                self.record_failure(&executor_id, &e.to_string());
                return;
            }
            Err(_) => {
                self.record_failure(&executor_id, "snapshot deadline exceeded");
                return;
            }
        };

        self.fetch_failures.remove(&executor_id);
        self.store.set_degraded(&executor_id, false);
        let snapshot = snapshot_from(&executor_id, &account, &positions);
        let previous = self.store.latest(&executor_id);
        let changed = previous
            .as_ref()
            .map(|prev| snapshots_differ(prev, &snapshot))
            .unwrap_or(true);
        self.store.update(snapshot.clone());

        if !changed {
            return;
        }
        tracing::debug!(
            executor_id = %executor_id,
            buying_power = snapshot.buying_power,
            positions = snapshot.positions.len(),
            "account state changed, re-evaluating queue"
        );

        let promoted = self.evaluate_pending(config, &snapshot).await;
        if promoted > 0 {
            tracing::info!(executor_id = %executor_id, promoted, "queued signals became ready");
        }
        // Wake the processor on any change; it re-checks ready entries.
        self.store.notify(&executor_id);
    }

    /// Re-evaluate every pending entry for this executor against the fresh
    /// snapshot; CAS newly satisfied entries to ready. Returns the count
    /// promoted.
    async fn evaluate_pending(&self, config: &ExecutorConfig, snapshot: &AccountSnapshot) -> u64 {
        let pending = match self.queue.pending_for(&config.id).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(executor_id = %config.id, error = %e, "pending scan failed");
                return 0;
            }
        };

        let ctx = ConditionContext {
            snapshot,
            executor: config,
            market_open: self.clock.is_open_now(),
        };

        let mut promoted = 0;
        for entry in pending {
            if entry.conditions.iter().all(|c| c.evaluate(&ctx)) {
                match self.queue.mark_ready(&entry.queue_id).await {
                    Ok(true) => promoted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(queue_id = %entry.queue_id, error = %e, "mark_ready failed")
                    }
                }
            }
        }
        promoted
    }

    fn record_failure(&self, executor_id: &str, error: &str) {
        // Previous snapshot stays in place; the diff step is skipped.
        let failures = {
            let mut entry = self.fetch_failures.entry(executor_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        tracing::warn!(executor_id, error, failures, "account snapshot fetch failed");
        if failures >= DEGRADED_AFTER_FAILURES {
            self.store.set_degraded(executor_id, true);
        }
    }
}

/// Convert an executor's wire account + positions into the core snapshot.
pub fn snapshot_from(
    executor_id: &str,
    account: &ExecutorAccount,
    positions: &[ExecutorPosition],
) -> AccountSnapshot {
    let positions: BTreeMap<String, Position> = positions
        .iter()
        .filter_map(|p| {
            let qty = p.qty_decimal().to_f64().unwrap_or(0.0).abs();
            if qty <= 0.0 {
                return None;
            }
            Some((
                p.symbol.clone(),
                Position {
                    symbol: p.symbol.clone(),
                    side: if p.is_long() {
                        PositionSide::Long
                    } else {
                        PositionSide::Short
                    },
                    qty,
                    avg_entry_price: p.avg_entry_price_decimal().to_f64().unwrap_or(0.0),
                },
            ))
        })
        .collect();

    AccountSnapshot {
        executor_id: executor_id.to_string(),
        buying_power: account.buying_power_decimal().to_f64().unwrap_or(0.0),
        portfolio_value: account.portfolio_value_decimal().to_f64().unwrap_or(0.0),
        positions,
        sampled_at: Utc::now(),
    }
}

/// Change detection: buying power moved, or any position opened, closed,
/// flipped, or resized.
pub fn snapshots_differ(prev: &AccountSnapshot, next: &AccountSnapshot) -> bool {
    if (prev.buying_power - next.buying_power).abs() > 1e-6 {
        return true;
    }
    if prev.positions.len() != next.positions.len() {
        return true;
    }
    for (symbol, position) in &next.positions {
        match prev.positions.get(symbol) {
            None => return true,
            Some(old) => {
                if old.side != position.side || (old.qty - position.qty).abs() > 1e-9 {
                    return true;
                }
            }
        }
    }
    false
}
