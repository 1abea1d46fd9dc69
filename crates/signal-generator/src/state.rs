use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Streaming per-symbol volatility: exponentially weighted variance of
/// simple returns, updated in O(1) per observation instead of recomputing a
/// full window.
#[derive(Debug, Clone)]
pub struct StreamingVolatility {
    lambda: f64,
    ewma_var: f64,
    observations: u64,
}

impl StreamingVolatility {
    pub fn new() -> Self {
        Self {
            // RiskMetrics-style decay.
            lambda: 0.94,
            ewma_var: 0.0,
            observations: 0,
        }
    }

    pub fn observe_return(&mut self, r: f64) {
        if self.observations == 0 {
            self.ewma_var = r * r;
        } else {
            self.ewma_var = self.lambda * self.ewma_var + (1.0 - self.lambda) * r * r;
        }
        self.observations += 1;
    }

    /// Sigma in percent; None until enough observations to mean anything.
    pub fn sigma_pct(&self) -> Option<f64> {
        if self.observations < 5 {
            return None;
        }
        Some(self.ewma_var.sqrt() * 100.0)
    }
}

impl Default for StreamingVolatility {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable per-symbol cycle state. Owned by the single cycle currently
/// processing the symbol; the scheduler's try-lock prevents overlap.
#[derive(Debug, Default)]
pub struct SymbolState {
    pub last_price: Option<f64>,
    /// Rolling price window feeding the regime detector.
    pub prices: VecDeque<f64>,
    pub volatility: StreamingVolatility,
    pub last_generated_at: Option<DateTime<Utc>>,
    price_window: usize,
}

impl SymbolState {
    pub fn new(price_window: usize) -> Self {
        Self {
            price_window: price_window.max(2),
            ..Self::default()
        }
    }

    pub fn observe_price(&mut self, price: f64) {
        if let Some(last) = self.last_price {
            if last > 0.0 {
                self.volatility.observe_return((price - last) / last);
            }
        }
        self.last_price = Some(price);
        self.prices.push_back(price);
        while self.prices.len() > self.price_window {
            self.prices.pop_front();
        }
    }

    pub fn price_history(&self) -> Vec<f64> {
        self.prices.iter().copied().collect()
    }
}
