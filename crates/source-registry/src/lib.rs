pub mod circuit_breaker;
pub mod health;
pub mod http_source;
pub mod rate_limiter;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use health::{SourceHealth, SourceHealthSnapshot};
pub use http_source::HttpSource;
pub use rate_limiter::TokenBucket;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use signal_core::{SignalSource, SourceConfig, SourceError, SourceSignal, SourceStyle};

/// A registered source with its protective machinery.
struct ManagedSource {
    source: Arc<dyn SignalSource>,
    limiter: TokenBucket,
    breaker: CircuitBreaker,
    health: SourceHealth,
}

/// Holds every configured data source behind rate limiting and circuit
/// breaking, and fans fetches out so one slow source never blocks another.
pub struct SourceRegistry {
    sources: Vec<ManagedSource>,
    fetch_deadline: Duration,
}

impl SourceRegistry {
    pub fn new(fetch_deadline: Duration) -> Self {
        Self {
            sources: Vec::new(),
            fetch_deadline,
        }
    }

    /// Register a source under the given config's limiter/breaker parameters.
    pub fn register(&mut self, config: &SourceConfig, source: Arc<dyn SignalSource>) {
        self.sources.push(ManagedSource {
            source,
            limiter: TokenBucket::per_minute(config.rate_limit_rpm),
            breaker: CircuitBreaker::new(
                config.circuit_fail_threshold,
                Duration::from_secs(config.circuit_cooldown_seconds),
            ),
            health: SourceHealth::default(),
        });
        // Deterministic fan-out and consensus iteration order.
        self.sources
            .sort_by(|a, b| a.source.source_id().cmp(b.source.source_id()));
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Style lookup used by consensus regime reweighting.
    pub fn style_of(&self, source_id: &str) -> Option<SourceStyle> {
        self.sources
            .iter()
            .find(|m| m.source.source_id() == source_id)
            .map(|m| m.source.style())
    }

    /// Fetch from a single source by id, through its limiter and breaker.
    /// Used when some sources were served from cache and only the misses
    /// need the upstream call.
    pub async fn fetch(&self, source_id: &str, symbol: &str) -> Result<SourceSignal, SourceError> {
        let managed = self
            .sources
            .iter()
            .find(|m| m.source.source_id() == source_id)
            .ok_or_else(|| SourceError::Upstream(format!("unknown source {source_id}")))?;
        self.fetch_one(managed, symbol).await
    }

    /// Fetch from every registered source concurrently. Individual failures
    /// are recorded and skipped; the returned subset may be empty, which the
    /// caller treats as an aborted cycle.
    pub async fn fetch_all(&self, symbol: &str) -> Vec<SourceSignal> {
        let fetches = self.sources.iter().map(|managed| async move {
            match self.fetch_one(managed, symbol).await {
                Ok(signal) => Some(signal),
                Err(e) => {
                    tracing::debug!(
                        source_id = managed.source.source_id(),
                        symbol,
                        error = %e,
                        "source fetch failed"
                    );
                    None
                }
            }
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }

    async fn fetch_one(
        &self,
        managed: &ManagedSource,
        symbol: &str,
    ) -> Result<SourceSignal, SourceError> {
        if !managed.breaker.allow() {
            managed.health.record_failure("circuit open");
            return Err(SourceError::CircuitOpen);
        }
        if !managed.limiter.try_acquire() {
            managed.health.record_failure("rate limited");
            return Err(SourceError::RateLimited);
        }

        let result = tokio::time::timeout(self.fetch_deadline, managed.source.fetch(symbol)).await;
        let result = match result {
            Ok(inner) => inner,
            Err(_) => Err(SourceError::Timeout),
        };

        match &result {
            Ok(signal) => {
                if let Err(reason) = signal.validate() {
                    managed.breaker.record_failure();
                    managed.health.record_failure(&reason);
                    return Err(SourceError::BadData(reason));
                }
                managed.breaker.record_success();
                managed.health.record_success();
            }
            Err(e) => {
                if e.counts_as_failure() {
                    managed.breaker.record_failure();
                }
                managed.health.record_failure(&e.to_string());
            }
        }
        result
    }

    /// Health view for every source, for the health endpoint.
    pub fn health_snapshots(&self) -> Vec<SourceHealthSnapshot> {
        self.sources
            .iter()
            .map(|m| m.health.snapshot(m.source.source_id(), m.breaker.state()))
            .collect()
    }
}
