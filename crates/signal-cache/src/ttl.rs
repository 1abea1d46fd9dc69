use std::time::Duration;

use signal_core::{CacheConfig, MarketClock};

/// Adaptive TTL policy: long when the market is closed, shrinking as
/// measured per-symbol volatility rises while it is open.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    config: CacheConfig,
    clock: MarketClock,
}

impl TtlPolicy {
    pub fn new(config: CacheConfig, clock: MarketClock) -> Self {
        Self { config, clock }
    }

    /// `volatility_pct` is the symbol's rolling daily sigma in percent;
    /// None means not yet measured and gets the normal-session TTL.
    pub fn ttl_for(&self, volatility_pct: Option<f64>) -> Duration {
        if !self.clock.is_open_now() {
            return Duration::from_secs(self.config.ttl_closed_seconds);
        }
        let secs = match volatility_pct {
            Some(v) if v > self.config.high_vol_threshold_pct => self.config.ttl_high_vol_seconds,
            Some(v) if v < self.config.low_vol_threshold_pct => self.config.ttl_low_vol_seconds,
            _ => self.config.ttl_normal_seconds,
        };
        Duration::from_secs(secs)
    }
}
