use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;

/// Directional read from a single data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    /// Sign used in weighted consensus scoring (LONG=+1, SHORT=-1, NEUTRAL=0).
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Neutral => 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "LONG",
            Direction::Short => "SHORT",
            Direction::Neutral => "NEUTRAL",
        }
    }
}

/// Trade action carried on a persisted signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    /// LONG maps to BUY, SHORT maps to SELL. NEUTRAL never becomes a signal.
    pub fn from_direction(direction: Direction) -> Option<Self> {
        match direction {
            Direction::Long => Some(Action::Buy),
            Direction::Short => Some(Action::Sell),
            Direction::Neutral => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            _ => None,
        }
    }
}

/// Behavioral classification of a data source, used for regime reweighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStyle {
    Momentum,
    MeanReversion,
    Breakout,
    Sentiment,
}

/// One source's directional read for one symbol. Immutable; lives for a
/// single generation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSignal {
    pub source_id: String,
    pub symbol: String,
    pub direction: Direction,
    /// 0-100 scale.
    pub confidence: f64,
    #[serde(default)]
    pub price: Option<f64>,
    /// Missing timestamps are accepted by the staleness filter (fail-open).
    #[serde(default)]
    pub as_of: Option<DateTime<Utc>>,
}

impl SourceSignal {
    pub fn validate(&self) -> Result<(), String> {
        if self.source_id.is_empty() {
            return Err("source_id is empty".to_string());
        }
        if self.symbol.is_empty() {
            return Err("symbol is empty".to_string());
        }
        if !(0.0..=100.0).contains(&self.confidence) {
            return Err(format!("confidence {} out of [0,100]", self.confidence));
        }
        if let Some(p) = self.price {
            if !p.is_finite() || p <= 0.0 {
                return Err(format!("price {} is not a positive finite number", p));
            }
        }
        Ok(())
    }
}

/// Market regime for a symbol, classified from recent price history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    TrendingUp,
    TrendingDown,
    RangeBound,
    HighVolatility,
}

impl Regime {
    pub fn as_str(&self) -> &'static str {
        match self {
            Regime::TrendingUp => "trending_up",
            Regime::TrendingDown => "trending_down",
            Regime::RangeBound => "range_bound",
            Regime::HighVolatility => "high_volatility",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trending_up" => Some(Regime::TrendingUp),
            "trending_down" => Some(Regime::TrendingDown),
            "range_bound" => Some(Regime::RangeBound),
            "high_volatility" => Some(Regime::HighVolatility),
            _ => None,
        }
    }
}

/// Fused direction + confidence across sources under one regime.
/// Ephemeral input to a `SignalDraft`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Consensus {
    pub direction: Direction,
    /// 0-100 scale.
    pub confidence: f64,
    /// Final (regime-adjusted, renormalized) weight per contributing source.
    /// BTreeMap so serialization and iteration are deterministic.
    pub weights: BTreeMap<String, f64>,
    pub contributing: Vec<String>,
}

/// A signal as built by the generator, before the ledger assigns chain fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalDraft {
    pub signal_id: String,
    pub symbol: String,
    pub action: Action,
    pub entry_price: f64,
    /// 0-100 scale.
    pub confidence: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub rationale: String,
    pub generated_at: DateTime<Utc>,
    pub regime: Regime,
    pub source_weights: BTreeMap<String, f64>,
}

impl SignalDraft {
    /// Invariants checked before the draft is accepted for persistence.
    pub fn validate(&self, min_confidence: f64) -> Result<(), String> {
        if self.signal_id.is_empty() {
            return Err("signal_id is empty".to_string());
        }
        if self.symbol.is_empty() {
            return Err("symbol is empty".to_string());
        }
        if !self.entry_price.is_finite() || self.entry_price <= 0.0 {
            return Err(format!("entry_price {} invalid", self.entry_price));
        }
        if self.confidence < min_confidence || self.confidence > 100.0 {
            return Err(format!(
                "confidence {:.2} outside [{:.2},100]",
                self.confidence, min_confidence
            ));
        }
        if self.rationale.trim().len() < 20 {
            return Err(format!(
                "rationale too short ({} chars, need 20)",
                self.rationale.trim().len()
            ));
        }
        Ok(())
    }
}

/// A persisted, immutable trading recommendation with hash-chain fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub symbol: String,
    pub action: Action,
    pub entry_price: f64,
    pub confidence: f64,
    pub stop_price: Option<f64>,
    pub target_price: Option<f64>,
    pub rationale: String,
    pub generated_at: DateTime<Utc>,
    pub regime: Regime,
    pub source_weights: BTreeMap<String, f64>,
    pub chain_index: i64,
    pub prev_hash: String,
    pub this_hash: String,
    pub retention_expires_at: DateTime<Utc>,
}

/// Side of a held position on an executor account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    /// The side a filled signal would open.
    pub fn from_action(action: Action) -> Self {
        match action {
            Action::Buy => PositionSide::Long,
            Action::Sell => PositionSide::Short,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Always > 0; the side carries the direction.
    pub qty: f64,
    pub avg_entry_price: f64,
}

/// Point-in-time view of one executor's account, owned by the account monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub executor_id: String,
    pub buying_power: f64,
    pub portfolio_value: f64,
    pub positions: BTreeMap<String, Position>,
    pub sampled_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Count of open positions whose symbol belongs to the given group.
    pub fn positions_in_group(&self, group_symbols: &[String]) -> usize {
        self.positions
            .keys()
            .filter(|sym| group_symbols.iter().any(|s| s == *sym))
            .count()
    }
}

/// Machine-readable reason a queued signal cannot yet execute, and what has
/// to change before it can.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    NeedsBuyingPower {
        executor_id: String,
        min_amount: f64,
    },
    NeedsPosition {
        executor_id: String,
        symbol: String,
        side: PositionSide,
    },
    NeedsNoDuplicate {
        executor_id: String,
        symbol: String,
        side: PositionSide,
    },
    NeedsUnderCorrelationCap {
        executor_id: String,
        group: String,
    },
    NeedsMarketOpen {
        symbol: String,
    },
    NeedsExecutorCapacity {
        executor_id: String,
    },
}

/// Everything a condition needs to evaluate itself against current state.
pub struct ConditionContext<'a> {
    pub snapshot: &'a AccountSnapshot,
    pub executor: &'a ExecutorConfig,
    pub market_open: bool,
}

impl Condition {
    /// True when the blocking cause has cleared against the given state.
    pub fn evaluate(&self, ctx: &ConditionContext<'_>) -> bool {
        match self {
            Condition::NeedsBuyingPower { min_amount, .. } => {
                ctx.snapshot.buying_power >= *min_amount
            }
            Condition::NeedsPosition { symbol, side, .. } => ctx
                .snapshot
                .position(symbol)
                .map(|p| p.side == *side)
                .unwrap_or(false),
            Condition::NeedsNoDuplicate { symbol, side, .. } => ctx
                .snapshot
                .position(symbol)
                .map(|p| p.side != *side)
                .unwrap_or(true),
            Condition::NeedsUnderCorrelationCap { group, .. } => {
                match ctx.executor.correlation_groups.iter().find(|g| g.name == *group) {
                    Some(g) => {
                        ctx.snapshot.positions_in_group(&g.symbols) < ctx.executor.max_per_group
                    }
                    // Group vanished from config; nothing to cap against.
                    None => true,
                }
            }
            Condition::NeedsMarketOpen { .. } => ctx.market_open,
            // Capacity pressure is transient and not visible in the snapshot;
            // let the entry back through pre-flight, which re-applies
            // backpressure if the executor queue is still saturated.
            Condition::NeedsExecutorCapacity { .. } => true,
        }
    }

    pub fn executor_id(&self) -> Option<&str> {
        match self {
            Condition::NeedsBuyingPower { executor_id, .. }
            | Condition::NeedsPosition { executor_id, .. }
            | Condition::NeedsNoDuplicate { executor_id, .. }
            | Condition::NeedsUnderCorrelationCap { executor_id, .. }
            | Condition::NeedsExecutorCapacity { executor_id } => Some(executor_id),
            Condition::NeedsMarketOpen { .. } => None,
        }
    }

    /// Short label used in rejection reasons and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Condition::NeedsBuyingPower { .. } => "needs_buying_power",
            Condition::NeedsPosition { .. } => "needs_position",
            Condition::NeedsNoDuplicate { .. } => "needs_no_duplicate",
            Condition::NeedsUnderCorrelationCap { .. } => "needs_under_correlation_cap",
            Condition::NeedsMarketOpen { .. } => "needs_market_open",
            Condition::NeedsExecutorCapacity { .. } => "needs_executor_capacity",
        }
    }
}

/// Queue entry lifecycle. Only `status` and `attempts` mutate after insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Ready,
    Executing,
    Executed,
    Expired,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Ready => "ready",
            QueueStatus::Executing => "executing",
            QueueStatus::Executed => "executed",
            QueueStatus::Expired => "expired",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "ready" => Some(QueueStatus::Ready),
            "executing" => Some(QueueStatus::Executing),
            "executed" => Some(QueueStatus::Executed),
            "expired" => Some(QueueStatus::Expired),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueueStatus::Executed | QueueStatus::Expired | QueueStatus::Failed
        )
    }
}

/// A deferred submission held until its conditions clear.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSignal {
    pub queue_id: String,
    pub signal_id: String,
    pub executor_id: String,
    pub conditions: Vec<Condition>,
    pub status: QueueStatus,
    pub attempts: i64,
    pub last_rejection_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub priority: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CorrelationGroup;

    fn snapshot_with(positions: Vec<Position>, buying_power: f64) -> AccountSnapshot {
        AccountSnapshot {
            executor_id: "ex1".to_string(),
            buying_power,
            portfolio_value: 100_000.0,
            positions: positions
                .into_iter()
                .map(|p| (p.symbol.clone(), p))
                .collect(),
            sampled_at: Utc::now(),
        }
    }

    fn executor() -> ExecutorConfig {
        ExecutorConfig {
            correlation_groups: vec![CorrelationGroup {
                name: "big_tech".to_string(),
                symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "GOOGL".to_string()],
            }],
            max_per_group: 2,
            ..ExecutorConfig::new("ex1")
        }
    }

    #[test]
    fn buying_power_condition_clears_at_threshold() {
        let snap = snapshot_with(vec![], 5_000.0);
        let exec = executor();
        let ctx = ConditionContext {
            snapshot: &snap,
            executor: &exec,
            market_open: true,
        };
        let cond = Condition::NeedsBuyingPower {
            executor_id: "ex1".to_string(),
            min_amount: 5_000.0,
        };
        assert!(cond.evaluate(&ctx));

        let cond = Condition::NeedsBuyingPower {
            executor_id: "ex1".to_string(),
            min_amount: 5_000.01,
        };
        assert!(!cond.evaluate(&ctx));
    }

    #[test]
    fn duplicate_condition_clears_when_position_closes() {
        let exec = executor();
        let held = snapshot_with(
            vec![Position {
                symbol: "AAPL".to_string(),
                side: PositionSide::Long,
                qty: 100.0,
                avg_entry_price: 190.0,
            }],
            10_000.0,
        );
        let cond = Condition::NeedsNoDuplicate {
            executor_id: "ex1".to_string(),
            symbol: "AAPL".to_string(),
            side: PositionSide::Long,
        };
        let ctx = ConditionContext {
            snapshot: &held,
            executor: &exec,
            market_open: true,
        };
        assert!(!cond.evaluate(&ctx));

        let flat = snapshot_with(vec![], 10_000.0);
        let ctx = ConditionContext {
            snapshot: &flat,
            executor: &exec,
            market_open: true,
        };
        assert!(cond.evaluate(&ctx));
    }

    #[test]
    fn correlation_cap_counts_group_members() {
        let exec = executor();
        let snap = snapshot_with(
            vec![
                Position {
                    symbol: "AAPL".to_string(),
                    side: PositionSide::Long,
                    qty: 10.0,
                    avg_entry_price: 190.0,
                },
                Position {
                    symbol: "MSFT".to_string(),
                    side: PositionSide::Long,
                    qty: 10.0,
                    avg_entry_price: 410.0,
                },
            ],
            10_000.0,
        );
        let cond = Condition::NeedsUnderCorrelationCap {
            executor_id: "ex1".to_string(),
            group: "big_tech".to_string(),
        };
        let ctx = ConditionContext {
            snapshot: &snap,
            executor: &exec,
            market_open: true,
        };
        // 2 of 2 slots used.
        assert!(!cond.evaluate(&ctx));
    }

    #[test]
    fn draft_validation_enforces_rationale_and_confidence() {
        let mut draft = SignalDraft {
            signal_id: "s1".to_string(),
            symbol: "AAPL".to_string(),
            action: Action::Buy,
            entry_price: 190.0,
            confidence: 80.0,
            stop_price: None,
            target_price: None,
            rationale: "Momentum and sentiment sources agree in trending_up regime".to_string(),
            generated_at: Utc::now(),
            regime: Regime::TrendingUp,
            source_weights: BTreeMap::new(),
        };
        assert!(draft.validate(75.0).is_ok());

        draft.rationale = "too short".to_string();
        assert!(draft.validate(75.0).is_err());

        draft.rationale = "Momentum and sentiment sources agree in trending_up regime".to_string();
        draft.confidence = 74.9;
        assert!(draft.validate(75.0).is_err());
        // Exactly at threshold is admitted.
        draft.confidence = 75.0;
        assert!(draft.validate(75.0).is_ok());
    }
}
