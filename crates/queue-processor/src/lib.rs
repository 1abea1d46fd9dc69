use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use account_monitor::SnapshotStore;
use signal_core::QueuedSignal;
use signal_distributor::{AttemptResult, Distributor};
use signal_ledger::SignalLedger;
use signal_queue::SignalQueue;

/// Drains ready queue entries per executor and re-submits them through the
/// distributor's single-executor path. Entries are claimed by CAS, so
/// running several processors is safe; each entry executes at most once.
pub struct QueueProcessor {
    queue: Arc<SignalQueue>,
    ledger: Arc<SignalLedger>,
    distributor: Arc<Distributor>,
    store: Arc<SnapshotStore>,
    max_sleep: Duration,
    retry_base: Duration,
    retry_cap: Duration,
}

impl QueueProcessor {
    pub fn new(
        queue: Arc<SignalQueue>,
        ledger: Arc<SignalLedger>,
        distributor: Arc<Distributor>,
        store: Arc<SnapshotStore>,
        max_sleep: Duration,
        retry_base: Duration,
        retry_cap: Duration,
    ) -> Self {
        Self {
            queue,
            ledger,
            distributor,
            store,
            max_sleep,
            retry_base,
            retry_cap,
        }
    }

    /// One worker per executor: wake on the account monitor's change signal
    /// or the max-sleep, whichever comes first, then drain.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.distributor
            .executor_ids()
            .into_iter()
            .map(|executor_id| {
                let processor = Arc::clone(&self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let notifier = processor.store.notifier(&executor_id);
                    loop {
                        tokio::select! {
                            _ = notifier.notified() => {}
                            _ = tokio::time::sleep(processor.max_sleep) => {}
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    break;
                                }
                                continue;
                            }
                        }
                        processor.drain(&executor_id).await;
                    }
                })
            })
            .collect()
    }

    /// Process every currently-ready entry for one executor, in
    /// `(priority DESC, enqueued_at ASC)` order.
    pub async fn drain(&self, executor_id: &str) {
        let ready = match self.queue.list_ready(executor_id).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!(executor_id, error = %e, "ready scan failed");
                return;
            }
        };
        for entry in ready {
            self.process_entry(entry).await;
        }
    }

    async fn process_entry(&self, entry: QueuedSignal) {
        // Claim; losers of the CAS skip this id.
        match self.queue.mark_executing(&entry.queue_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!(queue_id = %entry.queue_id, error = %e, "claim failed");
                return;
            }
        }

        let signal = match self.ledger.get(&entry.signal_id).await {
            Ok(Some(signal)) => signal,
            Ok(None) => {
                tracing::error!(
                    queue_id = %entry.queue_id,
                    signal_id = %entry.signal_id,
                    "queued signal missing from ledger"
                );
                let _ = self
                    .queue
                    .mark_failed(&entry.queue_id, "signal missing from ledger")
                    .await;
                return;
            }
            Err(e) => {
                // Ledger unavailable: put the entry back untouched.
                tracing::warn!(queue_id = %entry.queue_id, error = %e, "ledger read failed");
                let _ = self
                    .queue
                    .revert_to_pending(&entry.queue_id, None, None, false)
                    .await;
                return;
            }
        };

        if entry.attempts > 0 {
            tokio::time::sleep(self.backoff(entry.attempts)).await;
        }

        let result = match self
            .distributor
            .attempt_for(&entry.executor_id, &signal)
            .await
        {
            Some(result) => result,
            None => {
                let _ = self
                    .queue
                    .mark_failed(&entry.queue_id, "executor no longer configured")
                    .await;
                return;
            }
        };

        match result {
            AttemptResult::Accepted { broker_order_id } => {
                tracing::info!(
                    queue_id = %entry.queue_id,
                    signal_id = %entry.signal_id,
                    broker_order_id = %broker_order_id,
                    "queued signal executed"
                );
                let _ = self.queue.mark_executed(&entry.queue_id).await;
            }
            AttemptResult::Conditional { conditions, reason } => {
                // New cause, fresh wait; attempts are for transient retries.
                let _ = self
                    .queue
                    .revert_to_pending(&entry.queue_id, Some(&conditions), Some(&reason), false)
                    .await;
            }
            AttemptResult::Transient { reason } => {
                let attempts_now = entry.attempts + 1;
                if attempts_now >= self.queue.max_attempts() {
                    tracing::warn!(
                        queue_id = %entry.queue_id,
                        attempts = attempts_now,
                        reason = %reason,
                        "retry ladder exhausted"
                    );
                    let _ = self.queue.mark_failed(&entry.queue_id, &reason).await;
                } else {
                    let _ = self
                        .queue
                        .revert_to_pending(&entry.queue_id, None, Some(&reason), true)
                        .await;
                }
            }
            AttemptResult::Permanent { reason } => {
                let _ = self.queue.mark_failed(&entry.queue_id, &reason).await;
            }
        }
    }

    /// `base * 2^(attempts-1)` with +-20% jitter, capped.
    fn backoff(&self, attempts: i64) -> Duration {
        let exp = (attempts - 1).clamp(0, 16) as u32;
        let base = self.retry_base.as_millis() as u64;
        let raw = base.saturating_mul(1u64 << exp);
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        let with_jitter = (raw as f64 * jitter) as u64;
        Duration::from_millis(with_jitter.min(self.retry_cap.as_millis() as u64))
    }
}
