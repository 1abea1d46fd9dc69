pub mod keys;
pub mod local;
pub mod shared;
pub mod ttl;

pub use shared::SharedCache;
pub use ttl::TtlPolicy;

use local::LocalCache;
use signal_core::{CacheConfig, Consensus, MarketClock, SourceSignal};

/// Cached consensus together with the quantized input key it was computed
/// from, so a fresh input set only hits when it quantizes identically.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedConsensus {
    pub input_key: String,
    pub consensus: Consensus,
    /// Entry price observed when the consensus was computed; drives the
    /// generator's price-change early exit.
    pub entry_price: Option<f64>,
}

/// Two-tier cache layer: process-local DashMap tiers plus an optional shared
/// redis tier. All errors degrade silently to misses.
pub struct SignalCacheLayer {
    source_tier: LocalCache<SourceSignal>,
    consensus_tier: LocalCache<CachedConsensus>,
    shared: Option<SharedCache>,
    policy: TtlPolicy,
}

impl SignalCacheLayer {
    pub fn new(config: CacheConfig, clock: MarketClock, shared: Option<SharedCache>) -> Self {
        Self {
            source_tier: LocalCache::new(config.local_max_entries),
            consensus_tier: LocalCache::new(config.local_max_entries),
            policy: TtlPolicy::new(config, clock),
            shared,
        }
    }

    // -- per-source data ----------------------------------------------------

    pub async fn get_source(
        &self,
        source_id: &str,
        symbol: &str,
        volatility_pct: Option<f64>,
    ) -> Option<SourceSignal> {
        let local_key = keys::source_local_key(source_id, symbol);
        if let Some(hit) = self.source_tier.get(&local_key) {
            return Some(hit);
        }
        let shared = self.shared.as_ref()?;
        let ttl = self.policy.ttl_for(volatility_pct);
        let shared_key = keys::source_key(source_id, symbol, chrono::Utc::now(), ttl.as_secs());
        let hit: SourceSignal = shared.get(&shared_key).await?;
        // Promote to the local tier for the remainder of the window.
        self.source_tier.put(local_key, hit.clone(), ttl);
        Some(hit)
    }

    pub async fn put_source(&self, signal: &SourceSignal, volatility_pct: Option<f64>) {
        let ttl = self.policy.ttl_for(volatility_pct);
        self.source_tier.put(
            keys::source_local_key(&signal.source_id, &signal.symbol),
            signal.clone(),
            ttl,
        );
        if let Some(shared) = &self.shared {
            let key = keys::source_key(
                &signal.source_id,
                &signal.symbol,
                chrono::Utc::now(),
                ttl.as_secs(),
            );
            shared.set(&key, signal, ttl).await;
        }
    }

    // -- consensus ----------------------------------------------------------

    /// Hit only when the quantized input key matches the cached one.
    pub fn get_consensus(&self, symbol: &str, signals: &[SourceSignal]) -> Option<Consensus> {
        let cached = self.consensus_tier.get(symbol)?;
        if cached.input_key == keys::consensus_key(symbol, signals) {
            Some(cached.consensus)
        } else {
            None
        }
    }

    /// Last cached consensus regardless of inputs, for the price-change
    /// early exit (no fresh fetch to compare against).
    pub fn last_consensus(&self, symbol: &str) -> Option<CachedConsensus> {
        self.consensus_tier.get(symbol)
    }

    pub fn put_consensus(
        &self,
        symbol: &str,
        signals: &[SourceSignal],
        consensus: &Consensus,
        entry_price: Option<f64>,
        volatility_pct: Option<f64>,
    ) {
        let ttl = self.policy.ttl_for(volatility_pct);
        self.consensus_tier.put(
            symbol.to_string(),
            CachedConsensus {
                input_key: keys::consensus_key(symbol, signals),
                consensus: consensus.clone(),
                entry_price,
            },
            ttl,
        );
    }

    /// Periodic maintenance: expire and evict both local tiers down to their
    /// configured bounds. The shared tier expires server-side.
    pub fn trim(&self) {
        self.source_tier.trim();
        self.consensus_tier.trim();
    }

    pub fn local_entries(&self) -> usize {
        self.source_tier.len() + self.consensus_tier.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::Direction;
    use std::collections::BTreeMap;

    fn layer() -> SignalCacheLayer {
        SignalCacheLayer::new(CacheConfig::default(), MarketClock::new(true), None)
    }

    fn source_signal(source_id: &str, confidence: f64) -> SourceSignal {
        SourceSignal {
            source_id: source_id.to_string(),
            symbol: "AAPL".to_string(),
            direction: Direction::Long,
            confidence,
            price: Some(190.0),
            as_of: Some(chrono::Utc::now()),
        }
    }

    fn consensus() -> Consensus {
        Consensus {
            direction: Direction::Long,
            confidence: 86.0,
            weights: BTreeMap::from([("m".to_string(), 1.0)]),
            contributing: vec!["m".to_string()],
        }
    }

    #[tokio::test]
    async fn source_round_trip_through_local_tier() {
        let layer = layer();
        let signal = source_signal("m", 85.0);
        layer.put_source(&signal, Some(2.0)).await;
        let hit = layer.get_source("m", "AAPL", Some(2.0)).await;
        assert_eq!(hit.map(|s| s.confidence), Some(85.0));
    }

    #[tokio::test]
    async fn consensus_hits_only_on_quantized_match() {
        let layer = layer();
        let inputs = vec![source_signal("m", 87.0)];
        layer.put_consensus("AAPL", &inputs, &consensus(), Some(190.0), None);

        // 85.1 quantizes to the same bucket as 87.0.
        let near = vec![source_signal("m", 85.1)];
        assert!(layer.get_consensus("AAPL", &near).is_some());

        // 84.0 lands in a different bucket.
        let far = vec![source_signal("m", 84.0)];
        assert!(layer.get_consensus("AAPL", &far).is_none());

        // The early-exit read ignores inputs entirely.
        assert!(layer.last_consensus("AAPL").is_some());
    }
}
