use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use signal_core::{Regime, RegimeConfig};

/// Metrics behind a regime classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub short_ma: f64,
    pub long_ma: f64,
    /// Standard deviation of simple returns over the window, in percent.
    pub volatility_pct: f64,
    /// Regression slope over the short window, normalized by price.
    pub slope: f64,
    pub sample_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub metrics: RegimeMetrics,
    pub detected_at: DateTime<Utc>,
}

/// Rule-based regime classifier over a rolling price window.
pub struct RegimeDetector {
    config: RegimeConfig,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        Self { config }
    }

    /// Classify from recent prices, oldest first. With fewer than `long_ma`
    /// prices there is no trend evidence; the result is RangeBound so
    /// consensus degrades to base weights rather than inventing a trend.
    pub fn detect(&self, prices: &[f64]) -> RegimeReading {
        let metrics = self.calculate_metrics(prices);

        let regime = if prices.len() < self.config.long_ma {
            Regime::RangeBound
        } else if metrics.volatility_pct > self.config.high_vol_threshold_pct {
            Regime::HighVolatility
        } else {
            let gap_pct = if metrics.long_ma > 0.0 {
                (metrics.short_ma - metrics.long_ma) / metrics.long_ma * 100.0
            } else {
                0.0
            };
            if gap_pct > self.config.ma_gap_epsilon_pct && metrics.slope > 0.0 {
                Regime::TrendingUp
            } else if gap_pct < -self.config.ma_gap_epsilon_pct && metrics.slope < 0.0 {
                Regime::TrendingDown
            } else {
                Regime::RangeBound
            }
        };

        RegimeReading {
            regime,
            metrics,
            detected_at: Utc::now(),
        }
    }

    fn calculate_metrics(&self, prices: &[f64]) -> RegimeMetrics {
        RegimeMetrics {
            short_ma: trailing_mean(prices, self.config.short_ma),
            long_ma: trailing_mean(prices, self.config.long_ma),
            volatility_pct: returns_volatility_pct(prices),
            slope: normalized_slope(prices, self.config.short_ma),
            sample_size: prices.len(),
        }
    }
}

fn trailing_mean(prices: &[f64], window: usize) -> f64 {
    if prices.is_empty() || window == 0 {
        return 0.0;
    }
    let tail = &prices[prices.len().saturating_sub(window)..];
    tail.iter().sum::<f64>() / tail.len() as f64
}

fn returns_volatility_pct(prices: &[f64]) -> f64 {
    if prices.len() < 2 {
        return 0.0;
    }
    let returns: Vec<f64> = prices
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance =
        returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    variance.sqrt() * 100.0
}

/// Least-squares slope over the trailing window, normalized by the window's
/// average price so it is comparable across symbols.
fn normalized_slope(prices: &[f64], window: usize) -> f64 {
    let tail = &prices[prices.len().saturating_sub(window)..];
    let n = tail.len();
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let sum_x: f64 = (0..n).sum::<usize>() as f64;
    let sum_y: f64 = tail.iter().sum();
    let sum_xy: f64 = tail.iter().enumerate().map(|(i, p)| i as f64 * p).sum();
    let sum_x2: f64 = (0..n).map(|i| (i * i) as f64).sum();

    let denom = nf * sum_x2 - sum_x * sum_x;
    if denom == 0.0 {
        return 0.0;
    }
    let slope = (nf * sum_xy - sum_x * sum_y) / denom;
    let avg = sum_y / nf;
    if avg == 0.0 {
        0.0
    } else {
        slope / avg
    }
}

struct CacheSlot {
    reading: RegimeReading,
    price_at_detection: f64,
    last_access: DateTime<Utc>,
}

/// Size-bounded, TTL'd per-symbol cache in front of the detector. A cached
/// reading is reused until it ages out or the price moves at least
/// `invalidate_move_pct` from where it was computed.
pub struct CachedRegimeDetector {
    detector: RegimeDetector,
    cache: Mutex<HashMap<String, CacheSlot>>,
    max_entries: usize,
    ttl_seconds: i64,
    invalidate_move_pct: f64,
}

impl CachedRegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        let max_entries = config.cache_max_entries;
        let ttl_seconds = config.cache_ttl_seconds;
        let invalidate_move_pct = config.invalidate_move_pct;
        Self {
            detector: RegimeDetector::new(config),
            cache: Mutex::new(HashMap::new()),
            max_entries,
            ttl_seconds,
            invalidate_move_pct,
        }
    }

    pub fn reading_for(&self, symbol: &str, prices: &[f64]) -> RegimeReading {
        let now = Utc::now();
        let last_price = prices.last().copied().unwrap_or(0.0);

        {
            let mut cache = self.cache.lock().expect("regime cache lock poisoned");
            if let Some(slot) = cache.get_mut(symbol) {
                let fresh = (now - slot.reading.detected_at).num_seconds() < self.ttl_seconds;
                let moved = slot.price_at_detection != 0.0
                    && ((last_price - slot.price_at_detection) / slot.price_at_detection).abs()
                        * 100.0
                        >= self.invalidate_move_pct;
                if fresh && !moved {
                    slot.last_access = now;
                    return slot.reading.clone();
                }
            }
        }

        let reading = self.detector.detect(prices);
        let mut cache = self.cache.lock().expect("regime cache lock poisoned");
        cache.insert(
            symbol.to_string(),
            CacheSlot {
                reading: reading.clone(),
                price_at_detection: last_price,
                last_access: now,
            },
        );
        if cache.len() > self.max_entries {
            evict_lru(&mut cache);
        }
        reading
    }

    pub fn cached_symbols(&self) -> usize {
        self.cache.lock().expect("regime cache lock poisoned").len()
    }
}

fn evict_lru(cache: &mut HashMap<String, CacheSlot>) {
    if let Some(stalest) = cache
        .iter()
        .min_by_key(|(_, slot)| slot.last_access)
        .map(|(k, _)| k.clone())
    {
        cache.remove(&stalest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RegimeConfig {
        RegimeConfig::default()
    }

    fn trending(count: usize, step: f64) -> Vec<f64> {
        (0..count).map(|i| 100.0 + i as f64 * step).collect()
    }

    fn choppy(count: usize, swing_pct: f64) -> Vec<f64> {
        (0..count)
            .map(|i| {
                if i % 2 == 0 {
                    100.0
                } else {
                    100.0 * (1.0 + swing_pct / 100.0)
                }
            })
            .collect()
    }

    #[test]
    fn uptrend_is_detected() {
        let detector = RegimeDetector::new(config());
        let reading = detector.detect(&trending(100, 0.2));
        assert_eq!(reading.regime, Regime::TrendingUp);
        assert!(reading.metrics.slope > 0.0);
    }

    #[test]
    fn downtrend_is_detected() {
        let detector = RegimeDetector::new(config());
        let prices: Vec<f64> = (0..100).map(|i| 200.0 - i as f64 * 0.3).collect();
        let reading = detector.detect(&prices);
        assert_eq!(reading.regime, Regime::TrendingDown);
        assert!(reading.metrics.slope < 0.0);
    }

    #[test]
    fn violent_chop_is_high_volatility() {
        let detector = RegimeDetector::new(config());
        // 5% swings every bar: sigma far above the 3% threshold.
        let reading = detector.detect(&choppy(100, 5.0));
        assert_eq!(reading.regime, Regime::HighVolatility);
    }

    #[test]
    fn flat_market_is_range_bound() {
        let detector = RegimeDetector::new(config());
        let reading = detector.detect(&choppy(100, 0.2));
        assert_eq!(reading.regime, Regime::RangeBound);
    }

    #[test]
    fn short_history_degrades_to_range_bound() {
        let detector = RegimeDetector::new(config());
        let reading = detector.detect(&trending(10, 1.0));
        assert_eq!(reading.regime, Regime::RangeBound);
        assert_eq!(reading.metrics.sample_size, 10);
    }

    #[test]
    fn cache_reuses_until_price_moves() {
        let cached = CachedRegimeDetector::new(config());
        let prices = trending(100, 0.2);
        let first = cached.reading_for("AAPL", &prices);

        // Same prices: cached reading comes back (same detected_at).
        let second = cached.reading_for("AAPL", &prices);
        assert_eq!(first.detected_at, second.detected_at);

        // A >=1% move invalidates.
        let mut moved = prices.clone();
        let last = *moved.last().unwrap();
        moved.push(last * 1.02);
        let third = cached.reading_for("AAPL", &moved);
        assert!(third.detected_at >= first.detected_at);
        assert_eq!(cached.cached_symbols(), 1);
    }

    #[test]
    fn cache_is_size_bounded() {
        let mut cfg = config();
        cfg.cache_max_entries = 3;
        let cached = CachedRegimeDetector::new(cfg);
        let prices = trending(100, 0.2);
        for symbol in ["A", "B", "C", "D", "E"] {
            cached.reading_for(symbol, &prices);
        }
        assert!(cached.cached_symbols() <= 3);
    }
}
