pub mod db;
pub mod hash;

pub use db::connect;
pub use hash::{canonical_timestamp, chain_hash, GENESIS_HASH};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use signal_core::{Action, PipelineError, Regime, Signal, SignalDraft};

/// Result of a chain verification sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerification {
    Ok { checked: u64 },
    Mismatch { chain_index: i64 },
}

type SignalRow = (
    String,         // signal_id
    String,         // symbol
    String,         // action
    f64,            // entry_price
    f64,            // confidence
    Option<f64>,    // stop_price
    Option<f64>,    // target_price
    String,         // rationale
    String,         // generated_at
    String,         // regime
    String,         // source_weights_json
    i64,            // chain_index
    String,         // prev_hash
    String,         // this_hash
    String,         // retention_expires_at
);

const SELECT_COLUMNS: &str = "signal_id, symbol, action, entry_price, confidence, stop_price, \
     target_price, rationale, generated_at, regime, source_weights_json, chain_index, \
     prev_hash, this_hash, retention_expires_at";

/// Append-only, hash-chained signal store. A single writer lock serializes
/// appends; readers run concurrently against the pool.
pub struct SignalLedger {
    pool: SqlitePool,
    chain_lock: Mutex<()>,
    retention: Duration,
}

impl SignalLedger {
    pub fn new(pool: SqlitePool, retention_seconds: i64) -> Self {
        Self {
            pool,
            chain_lock: Mutex::new(()),
            retention: Duration::seconds(retention_seconds),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Append a draft to the chain. Assigns `chain_index`, `prev_hash`,
    /// `this_hash`, and `retention_expires_at`; returns the persisted signal.
    pub async fn append(&self, draft: SignalDraft) -> Result<Signal, PipelineError> {
        if draft.rationale.trim().len() < 20 {
            return Err(PipelineError::Validation(format!(
                "signal {} rationale shorter than 20 chars",
                draft.signal_id
            )));
        }
        if !draft.entry_price.is_finite() || draft.entry_price <= 0.0 {
            return Err(PipelineError::Validation(format!(
                "signal {} entry_price {} invalid",
                draft.signal_id, draft.entry_price
            )));
        }

        let _guard = self.chain_lock.lock().await;

        let head: Option<(i64, String)> = sqlx::query_as(
            "SELECT chain_index, this_hash FROM signals ORDER BY chain_index DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let (chain_index, prev_hash) = match head {
            Some((index, hash)) => (index + 1, hash),
            None => (1, GENESIS_HASH.to_string()),
        };

        let generated_at = canonical_timestamp(draft.generated_at);
        let this_hash = chain_hash(
            chain_index,
            &draft.signal_id,
            &draft.symbol,
            draft.action.as_str(),
            draft.entry_price,
            draft.confidence,
            &generated_at,
            &prev_hash,
        );
        let retention_expires_at = canonical_timestamp(draft.generated_at + self.retention);
        let weights_json =
            serde_json::to_string(&draft.source_weights).map_err(|e| db_err_str(e.to_string()))?;

        sqlx::query(
            "INSERT INTO signals (signal_id, symbol, action, entry_price, confidence, \
             stop_price, target_price, rationale, generated_at, regime, source_weights_json, \
             chain_index, prev_hash, this_hash, retention_expires_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&draft.signal_id)
        .bind(&draft.symbol)
        .bind(draft.action.as_str())
        .bind(draft.entry_price)
        .bind(draft.confidence)
        .bind(draft.stop_price)
        .bind(draft.target_price)
        .bind(&draft.rationale)
        .bind(&generated_at)
        .bind(draft.regime.as_str())
        .bind(&weights_json)
        .bind(chain_index)
        .bind(&prev_hash)
        .bind(&this_hash)
        .bind(&retention_expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::debug!(
            signal_id = %draft.signal_id,
            symbol = %draft.symbol,
            chain_index,
            "signal appended to ledger"
        );

        Ok(Signal {
            signal_id: draft.signal_id,
            symbol: draft.symbol,
            action: draft.action,
            entry_price: draft.entry_price,
            confidence: draft.confidence,
            stop_price: draft.stop_price,
            target_price: draft.target_price,
            rationale: draft.rationale,
            generated_at: draft.generated_at,
            regime: draft.regime,
            source_weights: draft.source_weights,
            chain_index,
            prev_hash,
            this_hash,
            retention_expires_at: parse_timestamp(&retention_expires_at)?,
        })
    }

    pub async fn get(&self, signal_id: &str) -> Result<Option<Signal>, PipelineError> {
        let row: Option<SignalRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM signals WHERE signal_id = ?"
        ))
        .bind(signal_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(row_to_signal).transpose()
    }

    /// The most recent `n` signals for a symbol, newest first.
    pub async fn latest(&self, symbol: &str, n: i64) -> Result<Vec<Signal>, PipelineError> {
        let rows: Vec<SignalRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM signals WHERE symbol = ? \
             ORDER BY chain_index DESC LIMIT ?"
        ))
        .bind(symbol)
        .bind(n)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_signal).collect()
    }

    /// Signals for a symbol within `[from, to]`, oldest first.
    pub async fn range(
        &self,
        symbol: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Signal>, PipelineError> {
        let rows: Vec<SignalRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM signals WHERE symbol = ? \
             AND generated_at >= ? AND generated_at <= ? ORDER BY chain_index ASC"
        ))
        .bind(symbol)
        .bind(canonical_timestamp(from))
        .bind(canonical_timestamp(to))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(row_to_signal).collect()
    }

    pub async fn max_chain_index(&self) -> Result<i64, PipelineError> {
        let (max,): (Option<i64>,) = sqlx::query_as("SELECT MAX(chain_index) FROM signals")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(max.unwrap_or(0))
    }

    /// Recompute every hash in `[from_index, to_index]` and check linkage.
    /// Returns the first mismatching index, or Ok with the count checked.
    pub async fn verify_chain(
        &self,
        from_index: i64,
        to_index: Option<i64>,
    ) -> Result<ChainVerification, PipelineError> {
        let from_index = from_index.max(1);
        let to_index = match to_index {
            Some(n) => n,
            None => self.max_chain_index().await?,
        };
        if to_index < from_index {
            return Ok(ChainVerification::Ok { checked: 0 });
        }

        let mut expected_prev = if from_index == 1 {
            GENESIS_HASH.to_string()
        } else {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT this_hash FROM signals WHERE chain_index = ?")
                    .bind(from_index - 1)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(db_err)?;
            match row {
                Some((hash,)) => hash,
                None => {
                    return Ok(ChainVerification::Mismatch {
                        chain_index: from_index - 1,
                    })
                }
            }
        };

        let rows: Vec<(i64, String, String, String, f64, f64, String, String, String)> =
            sqlx::query_as(
                "SELECT chain_index, signal_id, symbol, action, entry_price, confidence, \
                 generated_at, prev_hash, this_hash FROM signals \
                 WHERE chain_index >= ? AND chain_index <= ? ORDER BY chain_index ASC",
            )
            .bind(from_index)
            .bind(to_index)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut checked = 0u64;
        let mut expected_index = from_index;
        for (index, signal_id, symbol, action, entry_price, confidence, generated_at, prev, this) in
            rows
        {
            let recomputed = chain_hash(
                index,
                &signal_id,
                &symbol,
                &action,
                entry_price,
                confidence,
                &generated_at,
                &prev,
            );
            if index != expected_index || prev != expected_prev || recomputed != this {
                return Ok(ChainVerification::Mismatch { chain_index: index });
            }
            expected_prev = this;
            expected_index += 1;
            checked += 1;
        }
        Ok(ChainVerification::Ok { checked })
    }

    /// Audit rows for one signal, oldest first, as `(op, outcome)` pairs.
    pub async fn audit_for(&self, signal_id: &str) -> Result<Vec<(String, String)>, PipelineError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT op, outcome FROM signal_audit_log WHERE signal_id = ? ORDER BY id ASC",
        )
        .bind(signal_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows)
    }
}

fn row_to_signal(row: SignalRow) -> Result<Signal, PipelineError> {
    let (
        signal_id,
        symbol,
        action,
        entry_price,
        confidence,
        stop_price,
        target_price,
        rationale,
        generated_at,
        regime,
        source_weights_json,
        chain_index,
        prev_hash,
        this_hash,
        retention_expires_at,
    ) = row;

    let action = Action::parse(&action)
        .ok_or_else(|| PipelineError::Validation(format!("unknown action {action:?}")))?;
    let regime = Regime::parse(&regime)
        .ok_or_else(|| PipelineError::Validation(format!("unknown regime {regime:?}")))?;
    let source_weights: BTreeMap<String, f64> = serde_json::from_str(&source_weights_json)
        .map_err(|e| PipelineError::Validation(format!("bad source_weights_json: {e}")))?;

    Ok(Signal {
        signal_id,
        symbol,
        action,
        entry_price,
        confidence,
        stop_price,
        target_price,
        rationale,
        generated_at: parse_timestamp(&generated_at)?,
        regime,
        source_weights,
        chain_index,
        prev_hash,
        this_hash,
        retention_expires_at: parse_timestamp(&retention_expires_at)?,
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

fn db_err_str(e: String) -> PipelineError {
    PipelineError::Database(e)
}
