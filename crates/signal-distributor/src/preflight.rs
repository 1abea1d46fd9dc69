use signal_core::{AccountSnapshot, Condition, ExecutorConfig, PositionSide, Signal};

/// Local checks the distributor runs before any executor RPC.
#[derive(Debug, Clone, PartialEq)]
pub enum Preflight {
    Pass,
    /// Not eligible for this executor at all; terminal, no queue entry.
    Ineligible { reason: String },
    /// Blocked now but may clear; becomes a queue entry.
    Conditional {
        conditions: Vec<Condition>,
        reason: String,
    },
}

/// Check order: confidence floor, symbol allow/deny, side-aware position
/// rule, correlation caps. Backend risk validation comes after, via RPC.
pub fn run(signal: &Signal, config: &ExecutorConfig, snapshot: &AccountSnapshot) -> Preflight {
    if signal.confidence < config.min_confidence {
        return Preflight::Ineligible {
            reason: format!(
                "confidence {:.1} below executor floor {:.1}",
                signal.confidence, config.min_confidence
            ),
        };
    }
    if !config.symbol_allowed(&signal.symbol) {
        return Preflight::Ineligible {
            reason: format!("symbol {} not tradable on {}", signal.symbol, config.id),
        };
    }

    let opening_side = PositionSide::from_action(signal.action);
    match snapshot.position(&signal.symbol) {
        // Same-side add is a duplicate; opposite side closes (or flips) and
        // is always allowed.
        Some(position) if position.side == opening_side => {
            return Preflight::Conditional {
                conditions: vec![Condition::NeedsNoDuplicate {
                    executor_id: config.id.clone(),
                    symbol: signal.symbol.clone(),
                    side: opening_side,
                }],
                reason: format!(
                    "existing {} position on {}",
                    position.side.as_str(),
                    signal.symbol
                ),
            };
        }
        Some(_) => return Preflight::Pass,
        None => {}
    }

    // Opening a new position: group caps and the account-wide slot cap apply.
    let mut conditions = Vec::new();
    for group in &config.correlation_groups {
        if !group.symbols.iter().any(|s| s == &signal.symbol) {
            continue;
        }
        let open_in_group = snapshot
            .positions
            .keys()
            .filter(|sym| group.symbols.iter().any(|s| s == *sym))
            .count();
        if open_in_group >= config.max_per_group {
            conditions.push(Condition::NeedsUnderCorrelationCap {
                executor_id: config.id.clone(),
                group: group.name.clone(),
            });
        }
    }
    if !conditions.is_empty() {
        return Preflight::Conditional {
            reason: "correlation cap reached".to_string(),
            conditions,
        };
    }

    if snapshot.positions.len() >= config.max_positions {
        // Clears when any position closes; re-checked on every retry pass.
        return Preflight::Conditional {
            conditions: vec![Condition::NeedsExecutorCapacity {
                executor_id: config.id.clone(),
            }],
            reason: format!(
                "account at position cap ({}/{})",
                snapshot.positions.len(),
                config.max_positions
            ),
        };
    }

    Preflight::Pass
}
