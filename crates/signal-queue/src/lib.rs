use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use signal_core::{Condition, PipelineError, QueueConfig, QueueStatus, QueuedSignal};
use signal_ledger::canonical_timestamp;

type QueueRow = (
    String,         // queue_id
    String,         // signal_id
    String,         // executor_id
    String,         // conditions_json
    String,         // status
    i64,            // attempts
    Option<String>, // last_rejection_reason
    String,         // enqueued_at
    String,         // expires_at
    i64,            // priority
);

const SELECT_COLUMNS: &str = "queue_id, signal_id, executor_id, conditions_json, status, \
     attempts, last_rejection_reason, enqueued_at, expires_at, priority";

/// Persisted conditional queue over the ledger database. Status moves only
/// through compare-and-set transitions, each of which appends an audit row,
/// so concurrent processors get at-most-once execution per entry.
pub struct SignalQueue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl SignalQueue {
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn max_attempts(&self) -> i64 {
        self.config.max_attempts
    }

    /// Persist a conditional rejection. Returns the new queue id.
    pub async fn enqueue(
        &self,
        signal_id: &str,
        executor_id: &str,
        conditions: &[Condition],
        reason: Option<&str>,
        priority: i64,
        ttl_seconds: Option<i64>,
    ) -> Result<String, PipelineError> {
        let queue_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let ttl = ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        let conditions_json =
            serde_json::to_string(conditions).map_err(|e| PipelineError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO signal_queue (queue_id, signal_id, executor_id, conditions_json, \
             status, attempts, last_rejection_reason, enqueued_at, expires_at, priority) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
        )
        .bind(&queue_id)
        .bind(signal_id)
        .bind(executor_id)
        .bind(&conditions_json)
        .bind(QueueStatus::Pending.as_str())
        .bind(reason)
        .bind(canonical_timestamp(now))
        .bind(canonical_timestamp(now + Duration::seconds(ttl)))
        .bind(priority)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.audit(&queue_id, None, QueueStatus::Pending, reason).await?;
        tracing::info!(
            queue_id = %queue_id,
            signal_id = %signal_id,
            executor_id = %executor_id,
            conditions = conditions.len(),
            "signal queued pending conditions"
        );
        Ok(queue_id)
    }

    pub async fn get(&self, queue_id: &str) -> Result<Option<QueuedSignal>, PipelineError> {
        let row: Option<QueueRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM signal_queue WHERE queue_id = ?"
        ))
        .bind(queue_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(row_to_entry).transpose()
    }

    /// Pending entries for one executor, for condition re-evaluation.
    pub async fn pending_for(&self, executor_id: &str) -> Result<Vec<QueuedSignal>, PipelineError> {
        self.by_status(executor_id, QueueStatus::Pending).await
    }

    /// Ready entries for one executor, highest priority first, oldest first
    /// within a priority.
    pub async fn list_ready(&self, executor_id: &str) -> Result<Vec<QueuedSignal>, PipelineError> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM signal_queue \
             WHERE status = ? AND executor_id = ? \
             ORDER BY priority DESC, enqueued_at ASC"
        ))
        .bind(QueueStatus::Ready.as_str())
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_entry).collect()
    }

    async fn by_status(
        &self,
        executor_id: &str,
        status: QueueStatus,
    ) -> Result<Vec<QueuedSignal>, PipelineError> {
        let rows: Vec<QueueRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM signal_queue \
             WHERE status = ? AND executor_id = ? ORDER BY enqueued_at ASC"
        ))
        .bind(status.as_str())
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_entry).collect()
    }

    /// CAS pending -> ready.
    pub async fn mark_ready(&self, queue_id: &str) -> Result<bool, PipelineError> {
        self.transition(queue_id, QueueStatus::Pending, QueueStatus::Ready, None)
            .await
    }

    /// CAS ready -> executing. Exactly one concurrent caller wins.
    pub async fn mark_executing(&self, queue_id: &str) -> Result<bool, PipelineError> {
        self.transition(queue_id, QueueStatus::Ready, QueueStatus::Executing, None)
            .await
    }

    /// CAS executing -> executed.
    pub async fn mark_executed(&self, queue_id: &str) -> Result<bool, PipelineError> {
        self.transition(queue_id, QueueStatus::Executing, QueueStatus::Executed, None)
            .await
    }

    /// Terminal failure from executing.
    pub async fn mark_failed(&self, queue_id: &str, error: &str) -> Result<bool, PipelineError> {
        let changed = sqlx::query(
            "UPDATE signal_queue SET status = ?, last_rejection_reason = ? \
             WHERE queue_id = ? AND status = ?",
        )
        .bind(QueueStatus::Failed.as_str())
        .bind(error)
        .bind(queue_id)
        .bind(QueueStatus::Executing.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected()
            == 1;
        if changed {
            self.audit(queue_id, Some(QueueStatus::Executing), QueueStatus::Failed, Some(error))
                .await?;
        }
        Ok(changed)
    }

    /// Send an executing entry back to pending, optionally rewriting its
    /// conditions to the newly observed cause and bumping the attempt count.
    pub async fn revert_to_pending(
        &self,
        queue_id: &str,
        new_conditions: Option<&[Condition]>,
        reason: Option<&str>,
        bump_attempts: bool,
    ) -> Result<bool, PipelineError> {
        let conditions_json = match new_conditions {
            Some(conditions) => Some(
                serde_json::to_string(conditions)
                    .map_err(|e| PipelineError::Database(e.to_string()))?,
            ),
            None => None,
        };
        let changed = sqlx::query(
            "UPDATE signal_queue SET status = ?, \
             conditions_json = COALESCE(?, conditions_json), \
             last_rejection_reason = COALESCE(?, last_rejection_reason), \
             attempts = attempts + ? \
             WHERE queue_id = ? AND status = ?",
        )
        .bind(QueueStatus::Pending.as_str())
        .bind(conditions_json)
        .bind(reason)
        .bind(if bump_attempts { 1 } else { 0 })
        .bind(queue_id)
        .bind(QueueStatus::Executing.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected()
            == 1;
        if changed {
            self.audit(queue_id, Some(QueueStatus::Executing), QueueStatus::Pending, reason)
                .await?;
        }
        Ok(changed)
    }

    /// Idempotent sweep: every pending/ready entry past its expiry moves to
    /// expired. Returns how many entries this pass expired.
    pub async fn expire(&self) -> Result<u64, PipelineError> {
        let now = canonical_timestamp(Utc::now());
        let expired: Vec<(String, String)> = sqlx::query_as(
            "SELECT queue_id, status FROM signal_queue \
             WHERE status IN ('pending', 'ready') AND expires_at <= ?",
        )
        .bind(&now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut count = 0u64;
        for (queue_id, status) in expired {
            let from = QueueStatus::parse(&status).unwrap_or(QueueStatus::Pending);
            if self
                .transition(&queue_id, from, QueueStatus::Expired, Some("ttl elapsed"))
                .await?
            {
                count += 1;
            }
        }
        if count > 0 {
            tracing::info!(count, "expired queued signals");
        }
        Ok(count)
    }

    /// Queue depth per status for one executor, for the health endpoint.
    pub async fn depth_for(
        &self,
        executor_id: &str,
    ) -> Result<Vec<(String, i64)>, PipelineError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM signal_queue WHERE executor_id = ? GROUP BY status",
        )
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows)
    }

    async fn transition(
        &self,
        queue_id: &str,
        from: QueueStatus,
        to: QueueStatus,
        note: Option<&str>,
    ) -> Result<bool, PipelineError> {
        let changed = sqlx::query(
            "UPDATE signal_queue SET status = ? WHERE queue_id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(queue_id)
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?
        .rows_affected()
            == 1;
        if changed {
            self.audit(queue_id, Some(from), to, note).await?;
        }
        Ok(changed)
    }

    async fn audit(
        &self,
        queue_id: &str,
        from: Option<QueueStatus>,
        to: QueueStatus,
        note: Option<&str>,
    ) -> Result<(), PipelineError> {
        sqlx::query(
            "INSERT INTO queue_audit_log (queue_id, at, from_status, to_status, note) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(queue_id)
        .bind(canonical_timestamp(Utc::now()))
        .bind(from.map(|s| s.as_str()))
        .bind(to.as_str())
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

fn row_to_entry(row: QueueRow) -> Result<QueuedSignal, PipelineError> {
    let (
        queue_id,
        signal_id,
        executor_id,
        conditions_json,
        status,
        attempts,
        last_rejection_reason,
        enqueued_at,
        expires_at,
        priority,
    ) = row;
    let conditions: Vec<Condition> = serde_json::from_str(&conditions_json)
        .map_err(|e| PipelineError::Validation(format!("bad conditions_json: {e}")))?;
    let status = QueueStatus::parse(&status)
        .ok_or_else(|| PipelineError::Validation(format!("unknown queue status {status:?}")))?;
    Ok(QueuedSignal {
        queue_id,
        signal_id,
        executor_id,
        conditions,
        status,
        attempts,
        last_rejection_reason,
        enqueued_at: parse_timestamp(&enqueued_at)?,
        expires_at: parse_timestamp(&expires_at)?,
        priority,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, PipelineError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::Validation(format!("bad timestamp {raw:?}: {e}")))
}

fn db_err(e: sqlx::Error) -> PipelineError {
    PipelineError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::PositionSide;
    use std::sync::Arc;

    async fn queue() -> SignalQueue {
        let pool = signal_ledger::connect("sqlite::memory:").await.unwrap();
        // The queue references the signals table.
        seed_signal(&pool, "sig-1").await;
        SignalQueue::new(pool, QueueConfig::default())
    }

    async fn seed_signal(pool: &SqlitePool, signal_id: &str) {
        let ledger = signal_ledger::SignalLedger::new(pool.clone(), 1_000_000);
        let draft = signal_core::SignalDraft {
            signal_id: signal_id.to_string(),
            symbol: "AAPL".to_string(),
            action: signal_core::Action::Buy,
            entry_price: 190.0,
            confidence: 86.0,
            stop_price: None,
            target_price: None,
            rationale: "Momentum and sentiment sources agree under trending_up".to_string(),
            generated_at: Utc::now(),
            regime: signal_core::Regime::TrendingUp,
            source_weights: Default::default(),
        };
        ledger.append(draft).await.unwrap();
    }

    fn conditions() -> Vec<Condition> {
        vec![Condition::NeedsBuyingPower {
            executor_id: "ex1".to_string(),
            min_amount: 19_000.0,
        }]
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let queue = queue().await;
        let id = queue
            .enqueue("sig-1", "ex1", &conditions(), Some("INSUFFICIENT_BUYING_POWER"), 0, None)
            .await
            .unwrap();

        let entry = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.conditions, conditions());

        assert!(queue.mark_ready(&id).await.unwrap());
        assert!(queue.mark_executing(&id).await.unwrap());
        assert!(queue.mark_executed(&id).await.unwrap());
        assert!(queue
            .get(&id)
            .await
            .unwrap()
            .unwrap()
            .status
            .is_terminal());
    }

    #[tokio::test]
    async fn executing_cas_has_exactly_one_winner() {
        let queue = Arc::new(queue().await);
        let id = queue
            .enqueue("sig-1", "ex1", &conditions(), None, 0, None)
            .await
            .unwrap();
        queue.mark_ready(&id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            let id = id.clone();
            handles.push(tokio::spawn(
                async move { queue.mark_executing(&id).await },
            ));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn ready_ordering_is_priority_then_age() {
        let queue = queue().await;
        let low = queue.enqueue("sig-1", "ex1", &conditions(), None, 0, None).await.unwrap();
        let high = queue.enqueue("sig-1", "ex1", &conditions(), None, 5, None).await.unwrap();
        queue.mark_ready(&low).await.unwrap();
        queue.mark_ready(&high).await.unwrap();

        let ready = queue.list_ready("ex1").await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].queue_id, high);
        assert_eq!(ready[1].queue_id, low);
    }

    #[tokio::test]
    async fn revert_rewrites_conditions_and_bumps_attempts() {
        let queue = queue().await;
        let id = queue.enqueue("sig-1", "ex1", &conditions(), None, 0, None).await.unwrap();
        queue.mark_ready(&id).await.unwrap();
        queue.mark_executing(&id).await.unwrap();

        let new_conditions = vec![Condition::NeedsNoDuplicate {
            executor_id: "ex1".to_string(),
            symbol: "AAPL".to_string(),
            side: PositionSide::Long,
        }];
        assert!(queue
            .revert_to_pending(&id, Some(&new_conditions), Some("DUPLICATE_POSITION"), true)
            .await
            .unwrap());

        let entry = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.conditions, new_conditions);
        assert_eq!(
            entry.last_rejection_reason.as_deref(),
            Some("DUPLICATE_POSITION")
        );
    }

    #[tokio::test]
    async fn expire_is_idempotent() {
        let queue = queue().await;
        let id = queue
            .enqueue("sig-1", "ex1", &conditions(), None, 0, Some(0))
            .await
            .unwrap();

        // Entry expired immediately (ttl 0).
        assert_eq!(queue.expire().await.unwrap(), 1);
        assert_eq!(
            queue.get(&id).await.unwrap().unwrap().status,
            QueueStatus::Expired
        );
        // Second sweep is a no-op.
        assert_eq!(queue.expire().await.unwrap(), 0);
    }
}
