use thiserror::Error;

/// System failure taxonomy. Policy outcomes (NEUTRAL consensus, gate
/// failures, conditional rejections) are ordinary return values, never
/// errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Retry is appropriate (network blip, rate limit, upstream 5xx).
    #[error("transient: {0}")]
    Transient(String),

    /// A data source is unhealthy; the cycle proceeds without it.
    #[error("source degraded: {0}")]
    DegradedSource(String),

    /// Input failed a schema or invariant check; the offending input is dropped.
    #[error("validation: {0}")]
    Validation(String),

    /// Hash-chain mismatch or trigger-rejected mutation. No automated recovery.
    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("database error: {0}")]
    Database(String),

    /// Cannot make progress at all (ledger unreachable, invalid config).
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Error kinds a data-source fetch can produce, per the adapter contract.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("fetch timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    /// The source's circuit breaker is open; the fetch was not attempted.
    #[error("circuit open")]
    CircuitOpen,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("bad data: {0}")]
    BadData(String),
}

impl SourceError {
    /// Whether this failure should count against the circuit breaker.
    /// Local throttling and an already-open breaker are not upstream health
    /// evidence.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, SourceError::RateLimited | SourceError::CircuitOpen)
    }
}
