use std::collections::BTreeMap;

use signal_core::{Consensus, Direction, PipelineConfig, Regime, SourceSignal, SourceStyle};

/// Sources below this confidence carry no consensus information.
const MIN_SOURCE_CONFIDENCE: f64 = 50.0;

/// Regime adjustment factor for a source style. Trend regimes boost
/// trend-following styles and dampen mean reversion; range-bound does the
/// opposite; high volatility dampens everything directional.
fn regime_factor(regime: Regime, style: SourceStyle) -> f64 {
    match (regime, style) {
        (Regime::TrendingUp, SourceStyle::Momentum) => 1.3,
        (Regime::TrendingUp, SourceStyle::Breakout) => 1.2,
        (Regime::TrendingUp, SourceStyle::MeanReversion) => 0.7,
        (Regime::TrendingUp, SourceStyle::Sentiment) => 1.0,

        (Regime::TrendingDown, SourceStyle::Momentum) => 1.3,
        (Regime::TrendingDown, SourceStyle::Breakout) => 1.1,
        (Regime::TrendingDown, SourceStyle::MeanReversion) => 0.7,
        (Regime::TrendingDown, SourceStyle::Sentiment) => 1.0,

        (Regime::RangeBound, SourceStyle::Momentum) => 0.8,
        (Regime::RangeBound, SourceStyle::Breakout) => 0.8,
        (Regime::RangeBound, SourceStyle::MeanReversion) => 1.3,
        (Regime::RangeBound, SourceStyle::Sentiment) => 1.0,

        (Regime::HighVolatility, SourceStyle::Momentum) => 0.9,
        (Regime::HighVolatility, SourceStyle::Breakout) => 0.8,
        (Regime::HighVolatility, SourceStyle::MeanReversion) => 0.9,
        (Regime::HighVolatility, SourceStyle::Sentiment) => 1.0,
    }
}

/// Fuses per-source signals into one directional consensus under a regime.
///
/// Deterministic: for a fixed input set, regime, and config the output is
/// bit-identical. Iteration is sorted by source id throughout.
pub struct ConsensusEngine {
    base_weights: BTreeMap<String, f64>,
    styles: BTreeMap<String, SourceStyle>,
    agreement_floor: f64,
    agreement_bonus: f64,
}

impl ConsensusEngine {
    pub fn new(config: &PipelineConfig) -> Self {
        let base_weights = config.normalized_source_weights().into_iter().collect();
        let styles = config
            .sources
            .iter()
            .map(|s| (s.id.clone(), s.style))
            .collect();
        Self {
            base_weights,
            styles,
            agreement_floor: config.agreement_floor,
            agreement_bonus: config.agreement_bonus,
        }
    }

    /// Fuse the cycle's surviving source signals. An empty or fully filtered
    /// input set yields a NEUTRAL consensus with zero confidence.
    pub fn fuse(&self, signals: &[SourceSignal], regime: Regime) -> Consensus {
        // 1. Drop weak and directionless sources; unknown source ids carry
        // no configured weight and are dropped too.
        let mut survivors: Vec<&SourceSignal> = signals
            .iter()
            .filter(|s| s.direction != Direction::Neutral)
            .filter(|s| s.confidence >= MIN_SOURCE_CONFIDENCE)
            .filter(|s| self.base_weights.contains_key(&s.source_id))
            .collect();
        survivors.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        survivors.dedup_by(|a, b| a.source_id == b.source_id);

        if survivors.is_empty() {
            tracing::debug!(
                input = signals.len(),
                "no source survived the confidence/direction filter"
            );
            return self.neutral(BTreeMap::new());
        }

        // 2-4. Regime-adjust base weights and renormalize over survivors.
        let mut weights: BTreeMap<String, f64> = BTreeMap::new();
        for s in &survivors {
            let base = self.base_weights[&s.source_id];
            let style = self.styles[&s.source_id];
            weights.insert(s.source_id.clone(), base * regime_factor(regime, style));
        }
        let total: f64 = weights.values().sum();
        for w in weights.values_mut() {
            *w /= total;
        }

        // 5. Weighted direction score in [-1, 1].
        let score: f64 = survivors
            .iter()
            .map(|s| weights[&s.source_id] * s.direction.sign() * s.confidence / 100.0)
            .sum();

        // 6. Below the agreement floor (or exactly zero) there is no signal.
        if score.abs() < self.agreement_floor || score == 0.0 {
            return self.neutral(weights);
        }

        let direction = if score > 0.0 {
            Direction::Long
        } else {
            Direction::Short
        };
        let mut confidence = score.abs() * 100.0;

        // 8. Unanimity bonus.
        let unanimous = survivors
            .iter()
            .all(|s| s.direction == survivors[0].direction);
        if unanimous {
            confidence *= 1.0 + self.agreement_bonus;
        }
        confidence = confidence.min(100.0);

        Consensus {
            direction,
            confidence,
            contributing: survivors.iter().map(|s| s.source_id.clone()).collect(),
            weights,
        }
    }

    fn neutral(&self, weights: BTreeMap<String, f64>) -> Consensus {
        Consensus {
            direction: Direction::Neutral,
            confidence: 0.0,
            weights,
            contributing: Vec::new(),
        }
    }
}
