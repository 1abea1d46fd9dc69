use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use signal_core::PipelineError;

/// Open (creating if missing) the pipeline database and install the ledger
/// and queue schema, including the immutability triggers.
pub async fn connect(database_url: &str) -> Result<SqlitePool, PipelineError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| PipelineError::Fatal(format!("invalid DATABASE_URL: {e}")))?
        .create_if_missing(true);

    // A pooled in-memory database would give every connection its own empty
    // database; a single connection keeps tests on one store.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .map_err(|e| PipelineError::Fatal(format!("connecting to database: {e}")))?;

    init_schema(&pool).await?;
    Ok(pool)
}

async fn init_schema(pool: &SqlitePool) -> Result<(), PipelineError> {
    for statement in SCHEMA.split(';') {
        let stmt = statement.trim();
        if !stmt.is_empty() {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .map_err(|e| PipelineError::Fatal(format!("initializing schema: {e}")))?;
        }
    }
    // Triggers contain semicolons, so they are executed whole.
    for trigger in TRIGGERS {
        sqlx::query(trigger)
            .execute(pool)
            .await
            .map_err(|e| PipelineError::Fatal(format!("installing trigger: {e}")))?;
    }
    Ok(())
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS signals (
    signal_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    action TEXT NOT NULL,
    entry_price REAL NOT NULL,
    confidence REAL NOT NULL,
    stop_price REAL,
    target_price REAL,
    rationale TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    regime TEXT NOT NULL,
    source_weights_json TEXT NOT NULL,
    chain_index INTEGER NOT NULL UNIQUE,
    prev_hash TEXT NOT NULL,
    this_hash TEXT NOT NULL,
    retention_expires_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_signals_symbol_generated
    ON signals (symbol, generated_at);

CREATE TABLE IF NOT EXISTS signal_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempted_at TEXT NOT NULL,
    op TEXT NOT NULL,
    signal_id TEXT,
    outcome TEXT NOT NULL,
    actor TEXT
);

CREATE TABLE IF NOT EXISTS signal_queue (
    queue_id TEXT PRIMARY KEY,
    signal_id TEXT NOT NULL REFERENCES signals (signal_id),
    executor_id TEXT NOT NULL,
    conditions_json TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_rejection_reason TEXT,
    enqueued_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_queue_scan
    ON signal_queue (status, executor_id, priority, enqueued_at);

CREATE TABLE IF NOT EXISTS queue_audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id TEXT NOT NULL,
    at TEXT NOT NULL,
    from_status TEXT,
    to_status TEXT NOT NULL,
    note TEXT
)
";

/// Storage-layer immutability: UPDATE and DELETE on signals are recorded and
/// silently ignored (RAISE(IGNORE) keeps the audit row the trigger already
/// wrote). INSERT is recorded as allowed.
const TRIGGERS: &[&str] = &[
    "CREATE TRIGGER IF NOT EXISTS signals_deny_update
     BEFORE UPDATE ON signals
     BEGIN
         INSERT INTO signal_audit_log (attempted_at, op, signal_id, outcome)
         VALUES (datetime('now'), 'UPDATE', OLD.signal_id, 'denied');
         SELECT RAISE(IGNORE);
     END",
    "CREATE TRIGGER IF NOT EXISTS signals_deny_delete
     BEFORE DELETE ON signals
     BEGIN
         INSERT INTO signal_audit_log (attempted_at, op, signal_id, outcome)
         VALUES (datetime('now'), 'DELETE', OLD.signal_id, 'denied');
         SELECT RAISE(IGNORE);
     END",
    "CREATE TRIGGER IF NOT EXISTS signals_audit_insert
     AFTER INSERT ON signals
     BEGIN
         INSERT INTO signal_audit_log (attempted_at, op, signal_id, outcome)
         VALUES (datetime('now'), 'INSERT', NEW.signal_id, 'allowed');
     END",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_installs_on_fresh_database() {
        let pool = connect("sqlite::memory:").await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM signals")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
