pub mod preflight;

pub use preflight::Preflight;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::join_all;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, Semaphore};

use account_monitor::SnapshotStore;
use executor_trait::{
    ExecutorClient, ExecutorError, OrderSide, RejectReason, SignalOrder, SubmitOutcome,
    ValidateOutcome,
};
use signal_core::{
    AccountSnapshot, Action, Condition, ExecutorConfig, PositionSide, Signal,
};
use signal_queue::SignalQueue;

/// One registered executor with its isolation machinery.
pub struct ExecutorHandle {
    pub config: ExecutorConfig,
    client: Arc<dyn ExecutorClient>,
    /// Backpressure bound on in-flight submissions (default 1024).
    inflight: Semaphore,
    /// Bounded worker pool (default 4) isolating a slow executor.
    workers: Semaphore,
    /// Same-symbol submissions are serialized to keep close/open ordering.
    symbol_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ExecutorHandle {
    pub fn new(
        config: ExecutorConfig,
        client: Arc<dyn ExecutorClient>,
        workers: usize,
        inflight_bound: usize,
    ) -> Self {
        Self {
            config,
            client,
            inflight: Semaphore::new(inflight_bound),
            workers: Semaphore::new(workers.max(1)),
            symbol_locks: DashMap::new(),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<Mutex<()>> {
        self.symbol_locks
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Result of one submission attempt against one executor. The attempt never
/// touches the queue; callers decide between enqueueing (first distribution)
/// and updating an existing entry (queue processor).
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptResult {
    Accepted {
        broker_order_id: String,
    },
    /// Blocked on conditions that may clear.
    Conditional {
        conditions: Vec<Condition>,
        reason: String,
    },
    /// Transient RPC failure; retry is appropriate.
    Transient {
        reason: String,
    },
    /// Terminal: permanent rejection or ineligibility.
    Permanent {
        reason: String,
    },
}

/// What happened to a signal at one executor during distribution.
#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeKind {
    Accepted { broker_order_id: String },
    Enqueued { queue_id: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct DistributionOutcome {
    pub executor_id: String,
    pub kind: OutcomeKind,
    pub at: DateTime<Utc>,
}

/// Fans newly persisted signals out to every eligible executor, capturing
/// per-executor outcomes and converting conditional rejections into queue
/// entries.
pub struct Distributor {
    executors: Vec<Arc<ExecutorHandle>>,
    queue: Arc<SignalQueue>,
    store: Arc<SnapshotStore>,
    validate_timeout: Duration,
    submit_timeout: Duration,
    snapshot_timeout: Duration,
}

impl Distributor {
    pub fn new(
        executors: Vec<Arc<ExecutorHandle>>,
        queue: Arc<SignalQueue>,
        store: Arc<SnapshotStore>,
        validate_timeout: Duration,
        submit_timeout: Duration,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            executors,
            queue,
            store,
            validate_timeout,
            submit_timeout,
            snapshot_timeout,
        }
    }

    pub fn executor_ids(&self) -> Vec<String> {
        self.executors.iter().map(|h| h.config.id.clone()).collect()
    }

    /// Distribute one signal to all executors concurrently. One executor's
    /// slow or failed submission never delays the others.
    pub async fn distribute(&self, signal: &Signal) -> Vec<DistributionOutcome> {
        let attempts = self.executors.iter().map(|handle| {
            let handle = Arc::clone(handle);
            async move {
                let outcome = self.distribute_to(&handle, signal).await;
                DistributionOutcome {
                    executor_id: handle.config.id.clone(),
                    kind: outcome,
                    at: Utc::now(),
                }
            }
        });
        join_all(attempts).await
    }

    async fn distribute_to(&self, handle: &ExecutorHandle, signal: &Signal) -> OutcomeKind {
        // Backpressure: a saturated executor queue defers rather than drops
        // or blocks the generator.
        let permit = match handle.inflight.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                return self
                    .enqueue(
                        signal,
                        &handle.config.id,
                        &[Condition::NeedsExecutorCapacity {
                            executor_id: handle.config.id.clone(),
                        }],
                        "executor at in-flight capacity",
                    )
                    .await;
            }
        };

        let result = self.attempt(handle, signal, false).await;
        drop(permit);

        match result {
            AttemptResult::Accepted { broker_order_id } => {
                tracing::info!(
                    signal_id = %signal.signal_id,
                    executor_id = %handle.config.id,
                    broker_order_id = %broker_order_id,
                    "signal accepted"
                );
                OutcomeKind::Accepted { broker_order_id }
            }
            AttemptResult::Conditional { conditions, reason } => {
                self.enqueue(signal, &handle.config.id, &conditions, &reason)
                    .await
            }
            AttemptResult::Transient { reason } => {
                // Functionally a retry: queue it behind a capacity condition.
                self.enqueue(
                    signal,
                    &handle.config.id,
                    &[Condition::NeedsExecutorCapacity {
                        executor_id: handle.config.id.clone(),
                    }],
                    &reason,
                )
                .await
            }
            AttemptResult::Permanent { reason } => {
                tracing::warn!(
                    signal_id = %signal.signal_id,
                    executor_id = %handle.config.id,
                    reason = %reason,
                    "signal rejected terminally"
                );
                OutcomeKind::Rejected { reason }
            }
        }
    }

    async fn enqueue(
        &self,
        signal: &Signal,
        executor_id: &str,
        conditions: &[Condition],
        reason: &str,
    ) -> OutcomeKind {
        // Higher-confidence signals drain first.
        let priority = signal.confidence.round() as i64;
        match self
            .queue
            .enqueue(
                &signal.signal_id,
                executor_id,
                conditions,
                Some(reason),
                priority,
                None,
            )
            .await
        {
            Ok(queue_id) => OutcomeKind::Enqueued { queue_id },
            Err(e) => {
                tracing::error!(
                    signal_id = %signal.signal_id,
                    executor_id,
                    error = %e,
                    "failed to enqueue rejected signal"
                );
                OutcomeKind::Rejected {
                    reason: format!("enqueue failed: {e}"),
                }
            }
        }
    }

    /// One full submission attempt for one executor: account state,
    /// pre-flight, validate, submit. Used by both first distribution and the
    /// queue processor's re-submission (which passes `prefer_fresh` so stale
    /// snapshots cannot smuggle a duplicate through).
    pub async fn attempt(
        &self,
        handle: &ExecutorHandle,
        signal: &Signal,
        prefer_fresh: bool,
    ) -> AttemptResult {
        let _worker = handle.workers.acquire().await.expect("worker pool closed");

        let snapshot = match self.account_state(handle, prefer_fresh).await {
            Some(snapshot) => snapshot,
            None => {
                return AttemptResult::Transient {
                    reason: "account state unavailable".to_string(),
                }
            }
        };

        match preflight::run(signal, &handle.config, &snapshot) {
            Preflight::Pass => {}
            Preflight::Ineligible { reason } => return AttemptResult::Permanent { reason },
            Preflight::Conditional { conditions, reason } => {
                return AttemptResult::Conditional { conditions, reason }
            }
        }

        let order = build_order(signal);
        let lock = handle.symbol_lock(&signal.symbol);
        let _symbol_guard = lock.lock().await;

        // Backend risk validation.
        match tokio::time::timeout(self.validate_timeout, handle.client.validate(&order)).await {
            Ok(Ok(ValidateOutcome::Ok)) => {}
            Ok(Ok(ValidateOutcome::Reject { reason, message })) => {
                return self.rejection(signal, &handle.config.id, reason, message)
            }
            Ok(Err(ExecutorError::Transient(e))) => {
                return AttemptResult::Transient { reason: e }
            }
            Ok(Err(ExecutorError::Permanent(e))) => {
                return AttemptResult::Permanent { reason: e }
            }
            Err(_) => {
                return AttemptResult::Transient {
                    reason: "validate deadline exceeded".to_string(),
                }
            }
        }

        match tokio::time::timeout(self.submit_timeout, handle.client.submit(&order)).await {
            Ok(Ok(SubmitOutcome::Accepted { broker_order_id })) => {
                AttemptResult::Accepted { broker_order_id }
            }
            Ok(Ok(SubmitOutcome::Rejected { reason, message })) => {
                self.rejection(signal, &handle.config.id, reason, message)
            }
            Ok(Err(ExecutorError::Transient(e))) => AttemptResult::Transient { reason: e },
            Ok(Err(ExecutorError::Permanent(e))) => AttemptResult::Permanent { reason: e },
            Err(_) => AttemptResult::Transient {
                reason: "submit deadline exceeded".to_string(),
            },
        }
    }

    /// Resubmission entry point for the queue processor.
    pub async fn attempt_for(
        &self,
        executor_id: &str,
        signal: &Signal,
    ) -> Option<AttemptResult> {
        let handle = self
            .executors
            .iter()
            .find(|h| h.config.id == executor_id)?;
        Some(self.attempt(handle, signal, true).await)
    }

    fn rejection(
        &self,
        signal: &Signal,
        executor_id: &str,
        reason: RejectReason,
        message: String,
    ) -> AttemptResult {
        match map_rejection(&reason, signal, executor_id) {
            Some(conditions) => AttemptResult::Conditional {
                conditions,
                reason: message,
            },
            None => AttemptResult::Permanent { reason: message },
        }
    }

    /// Latest account state for pre-flight. The monitor's snapshot is used
    /// when available; `prefer_fresh` queries the executor directly first.
    async fn account_state(
        &self,
        handle: &ExecutorHandle,
        prefer_fresh: bool,
    ) -> Option<AccountSnapshot> {
        let cached = self.store.latest(&handle.config.id);
        if !prefer_fresh {
            if let Some(snapshot) = cached {
                return Some(snapshot);
            }
        }

        let fetched = tokio::time::timeout(self.snapshot_timeout, async {
            let account = handle.client.account().await?;
            let positions = handle.client.positions().await?;
            Ok::<_, ExecutorError>((account, positions))
        })
        .await;

        match fetched {
            Ok(Ok((account, positions))) => {
                let snapshot =
                    account_monitor::snapshot_from(&handle.config.id, &account, &positions);
                self.store.update(snapshot.clone());
                Some(snapshot)
            }
            _ => {
                // Stale beats nothing; pre-flight reruns against fresh state
                // on the next retry.
                self.store.latest(&handle.config.id)
            }
        }
    }
}

fn build_order(signal: &Signal) -> SignalOrder {
    SignalOrder {
        signal_id: signal.signal_id.clone(),
        symbol: signal.symbol.clone(),
        side: match signal.action {
            Action::Buy => OrderSide::Buy,
            Action::Sell => OrderSide::Sell,
        },
        qty: None,
        entry_price: Decimal::from_f64(signal.entry_price).unwrap_or_default(),
        confidence: signal.confidence,
        stop_price: signal.stop_price.and_then(Decimal::from_f64),
        target_price: signal.target_price.and_then(Decimal::from_f64),
    }
}

/// Translate a structured rejection into the queue's condition vocabulary.
/// `None` means the rejection is permanent.
pub fn map_rejection(
    reason: &RejectReason,
    signal: &Signal,
    executor_id: &str,
) -> Option<Vec<Condition>> {
    let condition = match reason {
        RejectReason::InsufficientBuyingPower { required } => {
            let min_amount = required
                .to_f64()
                .filter(|v| *v > 0.0)
                .unwrap_or(signal.entry_price);
            Condition::NeedsBuyingPower {
                executor_id: executor_id.to_string(),
                min_amount,
            }
        }
        RejectReason::NoPositionToClose { symbol } => {
            let symbol = if symbol.is_empty() {
                signal.symbol.clone()
            } else {
                symbol.clone()
            };
            // Closing a SELL needs a LONG on the book, and vice versa.
            let side = match signal.action {
                Action::Sell => PositionSide::Long,
                Action::Buy => PositionSide::Short,
            };
            Condition::NeedsPosition {
                executor_id: executor_id.to_string(),
                symbol,
                side,
            }
        }
        RejectReason::DuplicatePosition { symbol } => {
            let symbol = if symbol.is_empty() {
                signal.symbol.clone()
            } else {
                symbol.clone()
            };
            Condition::NeedsNoDuplicate {
                executor_id: executor_id.to_string(),
                symbol,
                side: PositionSide::from_action(signal.action),
            }
        }
        RejectReason::CorrelationCapExceeded { group } => Condition::NeedsUnderCorrelationCap {
            executor_id: executor_id.to_string(),
            group: group.clone(),
        },
        RejectReason::MarketClosed => Condition::NeedsMarketOpen {
            symbol: signal.symbol.clone(),
        },
        RejectReason::Other(_) => return None,
    };
    Some(vec![condition])
}
