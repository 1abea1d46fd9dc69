use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

use executor_trait::{
    ExecutorAccount, ExecutorClient, ExecutorError, ExecutorPosition, OrderSide, RejectReason,
    SignalOrder, SubmitOutcome, ValidateOutcome,
};

const DEFAULT_ORDER_NOTIONAL: f64 = 10_000.0;

struct PaperPosition {
    side: OrderSide,
    qty: f64,
    avg_entry_price: f64,
}

struct PaperState {
    buying_power: f64,
    positions: HashMap<String, PaperPosition>,
}

/// In-process simulated executor used when an executor entry has no
/// endpoint configured. Opens fixed-notional positions, nets closes and
/// flips, and rejects with the same structured reason codes a real backend
/// sends, so the whole queue loop is exercised end to end.
pub struct PaperExecutor {
    id: String,
    state: Mutex<PaperState>,
}

impl PaperExecutor {
    pub fn new(id: &str, starting_buying_power: f64) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(PaperState {
                buying_power: starting_buying_power,
                positions: HashMap::new(),
            }),
        }
    }

    fn order_qty(order: &SignalOrder) -> f64 {
        let price = order.entry_price.to_f64().unwrap_or(0.0);
        match order.qty.and_then(|q| q.to_f64()) {
            Some(qty) if qty > 0.0 => qty,
            _ if price > 0.0 => (DEFAULT_ORDER_NOTIONAL / price).floor().max(1.0),
            _ => 1.0,
        }
    }

    fn check(&self, order: &SignalOrder) -> Option<(RejectReason, String)> {
        let state = self.state.lock().expect("paper state lock poisoned");
        let price = order.entry_price.to_f64().unwrap_or(0.0);
        let qty = Self::order_qty(order);

        match state.positions.get(&order.symbol) {
            Some(position) if position.side == order.side => Some((
                RejectReason::DuplicatePosition {
                    symbol: order.symbol.clone(),
                },
                "DUPLICATE_POSITION".to_string(),
            )),
            // Close or flip: no buying power needed.
            Some(_) => None,
            None => {
                let required = price * qty;
                if state.buying_power < required {
                    Some((
                        RejectReason::InsufficientBuyingPower {
                            required: Decimal::from_f64_retain(required).unwrap_or_default(),
                        },
                        "INSUFFICIENT_BUYING_POWER".to_string(),
                    ))
                } else {
                    None
                }
            }
        }
    }
}

#[async_trait]
impl ExecutorClient for PaperExecutor {
    fn executor_id(&self) -> &str {
        &self.id
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn validate(&self, order: &SignalOrder) -> Result<ValidateOutcome, ExecutorError> {
        Ok(match self.check(order) {
            Some((reason, message)) => ValidateOutcome::Reject { reason, message },
            None => ValidateOutcome::Ok,
        })
    }

    async fn submit(&self, order: &SignalOrder) -> Result<SubmitOutcome, ExecutorError> {
        if let Some((reason, message)) = self.check(order) {
            return Ok(SubmitOutcome::Rejected { reason, message });
        }

        let mut state = self.state.lock().expect("paper state lock poisoned");
        let price = order.entry_price.to_f64().unwrap_or(0.0);
        let qty = Self::order_qty(order);

        match state.positions.remove(&order.symbol) {
            None => {
                state.buying_power -= price * qty;
                state.positions.insert(
                    order.symbol.clone(),
                    PaperPosition {
                        side: order.side,
                        qty,
                        avg_entry_price: price,
                    },
                );
            }
            Some(existing) => {
                // Opposite side: close, and flip with the remainder.
                state.buying_power += existing.avg_entry_price * existing.qty;
                if qty > existing.qty {
                    let remainder = qty - existing.qty;
                    state.buying_power -= price * remainder;
                    state.positions.insert(
                        order.symbol.clone(),
                        PaperPosition {
                            side: order.side,
                            qty: remainder,
                            avg_entry_price: price,
                        },
                    );
                }
            }
        }

        Ok(SubmitOutcome::Accepted {
            broker_order_id: Uuid::new_v4().to_string(),
        })
    }

    async fn account(&self) -> Result<ExecutorAccount, ExecutorError> {
        let state = self.state.lock().expect("paper state lock poisoned");
        let position_value: f64 = state
            .positions
            .values()
            .map(|p| p.avg_entry_price * p.qty)
            .sum();
        Ok(ExecutorAccount {
            id: self.id.clone(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: format!("{:.2}", state.buying_power),
            cash: format!("{:.2}", state.buying_power),
            portfolio_value: format!("{:.2}", state.buying_power + position_value),
            trading_blocked: false,
        })
    }

    async fn positions(&self) -> Result<Vec<ExecutorPosition>, ExecutorError> {
        let state = self.state.lock().expect("paper state lock poisoned");
        Ok(state
            .positions
            .iter()
            .map(|(symbol, p)| ExecutorPosition {
                symbol: symbol.clone(),
                side: match p.side {
                    OrderSide::Buy => "long".to_string(),
                    OrderSide::Sell => "short".to_string(),
                },
                qty: format!("{}", p.qty),
                avg_entry_price: format!("{:.2}", p.avg_entry_price),
                market_value: format!("{:.2}", p.avg_entry_price * p.qty),
                unrealized_pl: "0.00".to_string(),
            })
            .collect())
    }
}
