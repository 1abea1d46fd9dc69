use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use signal_ledger::{ChainVerification, SignalLedger};

use crate::{AlertLevel, AlertSink};

/// Health view of the hash chain.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityStatus {
    pub healthy: bool,
    pub first_mismatch: Option<i64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub verified_through: i64,
}

/// Periodic tamper detection: hourly incremental verification from the last
/// checkpoint, daily full-chain sweep. Any mismatch raises a critical alert
/// and latches the unhealthy flag; there is no automated recovery.
pub struct IntegritySweeper {
    ledger: Arc<SignalLedger>,
    alert: Arc<dyn AlertSink>,
    checkpoint: AtomicI64,
    status: Mutex<IntegrityStatus>,
    incremental_every: Duration,
    full_every: Duration,
}

impl IntegritySweeper {
    pub fn new(
        ledger: Arc<SignalLedger>,
        alert: Arc<dyn AlertSink>,
        incremental_every: Duration,
        full_every: Duration,
    ) -> Self {
        Self {
            ledger,
            alert,
            checkpoint: AtomicI64::new(0),
            status: Mutex::new(IntegrityStatus {
                healthy: true,
                first_mismatch: None,
                last_checked_at: None,
                verified_through: 0,
            }),
            incremental_every,
            full_every,
        }
    }

    pub fn status(&self) -> IntegrityStatus {
        self.status.lock().expect("integrity status lock poisoned").clone()
    }

    /// Whether distribution of the signal at `chain_index` must be aborted:
    /// only when the detected integrity failure is on that most recent write.
    pub fn should_block_distribution(&self, chain_index: i64) -> bool {
        let status = self.status();
        !status.healthy && status.first_mismatch == Some(chain_index)
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sweeper = self;
        let mut shutdown = shutdown;
        tokio::spawn(async move {
            let mut incremental = tokio::time::interval(sweeper.incremental_every);
            let mut full = tokio::time::interval(sweeper.full_every);
            // Both fire immediately on startup; consume the first full tick
            // so startup runs a single incremental pass.
            full.tick().await;
            loop {
                tokio::select! {
                    _ = incremental.tick() => {
                        sweeper.sweep_incremental().await;
                    }
                    _ = full.tick() => {
                        sweeper.sweep_full().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Verify from the last checkpoint to the current head.
    pub async fn sweep_incremental(&self) {
        let from = self.checkpoint.load(Ordering::Acquire) + 1;
        self.verify(from).await;
    }

    /// Verify the entire chain.
    pub async fn sweep_full(&self) {
        self.verify(1).await;
    }

    async fn verify(&self, from_index: i64) {
        let result = match self.ledger.verify_chain(from_index, None).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "chain verification could not run");
                return;
            }
        };
        let now = Utc::now();
        match result {
            ChainVerification::Ok { checked } => {
                let head = from_index + checked as i64 - 1;
                if checked > 0 {
                    self.checkpoint.fetch_max(head, Ordering::AcqRel);
                }
                let mut status = self.status.lock().expect("integrity status lock poisoned");
                status.last_checked_at = Some(now);
                status.verified_through = status.verified_through.max(head.max(0));
                tracing::debug!(from_index, checked, "chain verification ok");
            }
            ChainVerification::Mismatch { chain_index } => {
                {
                    let mut status = self.status.lock().expect("integrity status lock poisoned");
                    status.healthy = false;
                    status.first_mismatch = Some(chain_index);
                    status.last_checked_at = Some(now);
                }
                self.alert
                    .send(
                        AlertLevel::Critical,
                        &format!("ledger hash chain mismatch at chain_index {chain_index}"),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TracingAlertSink;
    use signal_core::{Action, Regime, SignalDraft};
    use std::collections::BTreeMap;

    async fn ledger_with(n: usize) -> Arc<SignalLedger> {
        let pool = signal_ledger::connect("sqlite::memory:").await.unwrap();
        let ledger = Arc::new(SignalLedger::new(pool, 1_000_000));
        for i in 0..n {
            ledger
                .append(SignalDraft {
                    signal_id: format!("sig-{i}"),
                    symbol: "AAPL".to_string(),
                    action: Action::Buy,
                    entry_price: 190.0,
                    confidence: 86.0,
                    stop_price: None,
                    target_price: None,
                    rationale: "Momentum and sentiment sources agree under trending_up"
                        .to_string(),
                    generated_at: Utc::now(),
                    regime: Regime::TrendingUp,
                    source_weights: BTreeMap::new(),
                })
                .await
                .unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn clean_chain_advances_the_checkpoint() {
        let ledger = ledger_with(3).await;
        let sweeper = IntegritySweeper::new(
            ledger,
            Arc::new(TracingAlertSink),
            Duration::from_secs(3600),
            Duration::from_secs(86_400),
        );
        sweeper.sweep_incremental().await;
        let status = sweeper.status();
        assert!(status.healthy);
        assert_eq!(status.verified_through, 3);

        // Second pass starts past the checkpoint and stays healthy.
        sweeper.sweep_incremental().await;
        assert!(sweeper.status().healthy);
    }

    #[tokio::test]
    async fn tamper_latches_unhealthy_and_blocks_that_write() {
        let ledger = ledger_with(3).await;
        sqlx::query("DROP TRIGGER signals_deny_update")
            .execute(ledger.pool())
            .await
            .unwrap();
        sqlx::query("UPDATE signals SET entry_price = 1.0 WHERE chain_index = 3")
            .execute(ledger.pool())
            .await
            .unwrap();

        let sweeper = IntegritySweeper::new(
            ledger,
            Arc::new(TracingAlertSink),
            Duration::from_secs(3600),
            Duration::from_secs(86_400),
        );
        sweeper.sweep_full().await;
        let status = sweeper.status();
        assert!(!status.healthy);
        assert_eq!(status.first_mismatch, Some(3));
        assert!(sweeper.should_block_distribution(3));
        assert!(!sweeper.should_block_distribution(2));
    }
}
