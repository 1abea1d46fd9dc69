use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Unified executor types (backend-agnostic)
// ---------------------------------------------------------------------------

/// Account state as delivered by an executor backend. Monetary fields arrive
/// as decimal strings, the way broker APIs ship them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorAccount {
    pub id: String,
    pub status: String,
    pub currency: String,
    pub buying_power: String,
    pub cash: String,
    pub portfolio_value: String,
    pub trading_blocked: bool,
}

impl ExecutorAccount {
    pub fn buying_power_decimal(&self) -> Decimal {
        Decimal::from_str(&self.buying_power).unwrap_or_default()
    }
    pub fn cash_decimal(&self) -> Decimal {
        Decimal::from_str(&self.cash).unwrap_or_default()
    }
    pub fn portfolio_value_decimal(&self) -> Decimal {
        Decimal::from_str(&self.portfolio_value).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorPosition {
    pub symbol: String,
    /// "long" or "short".
    pub side: String,
    pub qty: String,
    pub avg_entry_price: String,
    pub market_value: String,
    pub unrealized_pl: String,
}

impl ExecutorPosition {
    pub fn qty_decimal(&self) -> Decimal {
        Decimal::from_str(&self.qty).unwrap_or_default()
    }
    pub fn avg_entry_price_decimal(&self) -> Decimal {
        Decimal::from_str(&self.avg_entry_price).unwrap_or_default()
    }
    pub fn market_value_decimal(&self) -> Decimal {
        Decimal::from_str(&self.market_value).unwrap_or_default()
    }
    pub fn is_long(&self) -> bool {
        self.side.eq_ignore_ascii_case("long")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// The order an accepted signal turns into. `qty` of `None` delegates sizing
/// to the executor's own risk engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOrder {
    pub signal_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Option<Decimal>,
    pub entry_price: Decimal,
    pub confidence: f64,
    pub stop_price: Option<Decimal>,
    pub target_price: Option<Decimal>,
}

impl SignalOrder {
    pub fn buy(signal_id: impl Into<String>, symbol: impl Into<String>, entry_price: Decimal) -> Self {
        Self {
            signal_id: signal_id.into(),
            symbol: symbol.into(),
            side: OrderSide::Buy,
            qty: None,
            entry_price,
            confidence: 0.0,
            stop_price: None,
            target_price: None,
        }
    }
    pub fn sell(signal_id: impl Into<String>, symbol: impl Into<String>, entry_price: Decimal) -> Self {
        Self {
            signal_id: signal_id.into(),
            symbol: symbol.into(),
            side: OrderSide::Sell,
            qty: None,
            entry_price,
            confidence: 0.0,
            stop_price: None,
            target_price: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rejection vocabulary
// ---------------------------------------------------------------------------

/// Structured reason codes the pipeline recognizes. Anything else from a
/// backend is `Other` and treated as non-retryable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectReason {
    InsufficientBuyingPower {
        /// Minimum buying power the order would have needed.
        required: Decimal,
    },
    NoPositionToClose {
        symbol: String,
    },
    DuplicatePosition {
        symbol: String,
    },
    CorrelationCapExceeded {
        group: String,
    },
    MarketClosed,
    Other(String),
}

impl RejectReason {
    /// Decode a backend's wire-level reason code.
    pub fn from_code(code: &str, detail: Option<&str>) -> Self {
        match code {
            "INSUFFICIENT_BUYING_POWER" => RejectReason::InsufficientBuyingPower {
                required: detail
                    .and_then(|d| Decimal::from_str(d).ok())
                    .unwrap_or_default(),
            },
            "NO_POSITION_TO_CLOSE" => RejectReason::NoPositionToClose {
                symbol: detail.unwrap_or_default().to_string(),
            },
            "DUPLICATE_POSITION" => RejectReason::DuplicatePosition {
                symbol: detail.unwrap_or_default().to_string(),
            },
            "CORRELATION_CAP_EXCEEDED" => RejectReason::CorrelationCapExceeded {
                group: detail.unwrap_or_default().to_string(),
            },
            "MARKET_CLOSED" => RejectReason::MarketClosed,
            other => RejectReason::Other(other.to_string()),
        }
    }

    /// Conditional rejections may clear later; everything else is terminal.
    pub fn is_conditional(&self) -> bool {
        !matches!(self, RejectReason::Other(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ValidateOutcome {
    Ok,
    Reject { reason: RejectReason, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Accepted { broker_order_id: String },
    Rejected { reason: RejectReason, message: String },
}

/// RPC-level failure, distinct from a structured rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("transient executor error: {0}")]
    Transient(String),

    #[error("permanent executor error: {0}")]
    Permanent(String),
}

// ---------------------------------------------------------------------------
// Executor trait
// ---------------------------------------------------------------------------

/// The validate + submit RPC contract plus the account-state query the
/// pipeline consumes. Concrete backends (broker APIs, prop-firm gateways)
/// live outside the core.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    fn executor_id(&self) -> &str;

    /// Whether this is a paper/simulated account.
    fn is_paper(&self) -> bool;

    /// Backend risk validation, called after local pre-flight passes.
    async fn validate(&self, order: &SignalOrder) -> Result<ValidateOutcome, ExecutorError>;

    /// Submit for execution. A structured rejection is not an error.
    async fn submit(&self, order: &SignalOrder) -> Result<SubmitOutcome, ExecutorError>;

    async fn account(&self) -> Result<ExecutorAccount, ExecutorError>;

    async fn positions(&self) -> Result<Vec<ExecutorPosition>, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_recognized_reason_codes() {
        let reason = RejectReason::from_code("INSUFFICIENT_BUYING_POWER", Some("2500.50"));
        assert_eq!(
            reason,
            RejectReason::InsufficientBuyingPower {
                required: Decimal::from_str("2500.50").unwrap()
            }
        );
        assert!(reason.is_conditional());

        let reason = RejectReason::from_code("SYMBOL_NOT_TRADABLE", None);
        assert_eq!(reason, RejectReason::Other("SYMBOL_NOT_TRADABLE".to_string()));
        assert!(!reason.is_conditional());
    }

    #[test]
    fn account_decimal_bridge_defaults_on_garbage() {
        let account = ExecutorAccount {
            id: "a1".to_string(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: "100000.25".to_string(),
            cash: "not-a-number".to_string(),
            portfolio_value: "100000.25".to_string(),
            trading_blocked: false,
        };
        assert_eq!(
            account.buying_power_decimal(),
            Decimal::from_str("100000.25").unwrap()
        );
        assert_eq!(account.cash_decimal(), Decimal::default());
    }
}
