use std::sync::Arc;
use std::time::Instant;

use chrono::{Duration as ChronoDuration, Utc};
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use signal_core::{
    Action, Consensus, Direction, PipelineError, SignalDraft, SourceSignal,
};
use signal_distributor::OutcomeKind;

use crate::rationale::{build_rationale, RationaleContext};
use crate::state::SymbolState;
use crate::SignalGenerator;

/// What one generation cycle produced.
#[derive(Debug)]
pub enum CycleOutcome {
    Emitted {
        signal_id: String,
        chain_index: i64,
        /// Detached distribution task; tests can await it, the scheduler
        /// lets it run.
        distribution: Option<JoinHandle<()>>,
    },
    /// Gates or inputs ended the cycle with nothing written.
    NoSignal { reason: &'static str },
    /// The cycle did not run at all this tick.
    Skipped { reason: &'static str },
}

impl SignalGenerator {
    /// One generation cycle for one symbol: early-exit check, fetch,
    /// freshness filter, regime, consensus, gates, persist, distribute,
    /// state update. Any error is caught at the cycle boundary by the caller.
    pub async fn run_cycle(&self, symbol: &str) -> Result<CycleOutcome, PipelineError> {
        // Market-hours gate; disabled in 24/7 mode.
        if !self.clock.is_open_now() {
            return Ok(CycleOutcome::Skipped {
                reason: "market closed",
            });
        }

        let state_arc = self
            .states
            .entry(symbol.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SymbolState::new(self.config.regime.long_ma * 2)))
            })
            .clone();
        // Ticks for the same symbol must not overlap.
        let Ok(mut state) = state_arc.try_lock() else {
            return Ok(CycleOutcome::Skipped {
                reason: "previous cycle still in flight",
            });
        };
        let cycle_start = Instant::now();

        // 1. Price-change early exit: unchanged price + valid cached
        // consensus bypasses the fetch fan-out entirely.
        if let (Some(last_price), Some(cached)) =
            (state.last_price, self.cache.last_consensus(symbol))
        {
            if let Some(cached_price) = cached.entry_price {
                let change_pct = if cached_price > 0.0 {
                    ((last_price - cached_price) / cached_price).abs() * 100.0
                } else {
                    f64::MAX
                };
                if change_pct < self.config.price_change_threshold_pct
                    && cached.consensus.direction != Direction::Neutral
                    && cached.consensus.confidence >= self.config.min_confidence_threshold
                {
                    let outcome = self
                        .emit(symbol, &mut state, &cached.consensus, last_price)
                        .await?;
                    self.check_soft_budget(symbol, cycle_start);
                    return Ok(outcome);
                }
            }
        }

        // 2. Parallel fetch, cache first per source.
        let volatility = state.volatility.sigma_pct();
        let fetches = self.config.sources.iter().map(|source| {
            let source_id = source.id.clone();
            async move {
                if let Some(hit) = self.cache.get_source(&source_id, symbol, volatility).await {
                    return Some(hit);
                }
                match self.registry.fetch(&source_id, symbol).await {
                    Ok(signal) => {
                        self.cache.put_source(&signal, volatility).await;
                        Some(signal)
                    }
                    Err(e) => {
                        tracing::debug!(source_id, symbol, error = %e, "source unavailable");
                        None
                    }
                }
            }
        });
        let fetch_start = Instant::now();
        let mut signals: Vec<SourceSignal> = join_all(fetches).await.into_iter().flatten().collect();
        let fetch_ms = fetch_start.elapsed().as_millis() as u64;
        if fetch_ms > self.config.soft_budget_data_source_fetch_ms {
            tracing::warn!(
                symbol,
                fetch_ms,
                budget_ms = self.config.soft_budget_data_source_fetch_ms,
                "source fan-out exceeded soft budget"
            );
        }
        signals.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        // 3. Freshness filter: stale data is dropped, missing timestamps are
        // accepted (fail-open), the boundary is inclusive.
        let now = Utc::now();
        let max_staleness = ChronoDuration::seconds(self.config.max_staleness_seconds);
        signals.retain(|s| match s.as_of {
            None => true,
            Some(as_of) => now - as_of <= max_staleness,
        });

        if signals.is_empty() {
            self.monitor
                .cycles_exhausted_sources
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(CycleOutcome::NoSignal {
                reason: "no usable sources",
            });
        }

        // Entry price: first surviving source (sorted order) that carries one.
        let Some(price) = signals.iter().find_map(|s| s.price).or(state.last_price) else {
            return Ok(CycleOutcome::NoSignal {
                reason: "no entry price available",
            });
        };

        // 4. Regime (cached per symbol).
        let mut history = state.price_history();
        history.push(price);
        let regime = self.regimes.reading_for(symbol, &history).regime;

        // 5. Consensus, through the quantized cache.
        let consensus = match self.cache.get_consensus(symbol, &signals) {
            Some(consensus) => consensus,
            None => {
                let consensus = self.consensus.fuse(&signals, regime);
                self.cache
                    .put_consensus(symbol, &signals, &consensus, Some(price), volatility);
                consensus
            }
        };

        // 6. Gates, in order.
        if consensus.direction == Direction::Neutral {
            state.observe_price(price);
            return Ok(CycleOutcome::NoSignal {
                reason: "neutral consensus",
            });
        }
        if consensus.confidence < self.config.min_confidence_threshold {
            state.observe_price(price);
            return Ok(CycleOutcome::NoSignal {
                reason: "below confidence threshold",
            });
        }

        // 7-9. Build, persist, distribute.
        let outcome = self.emit(symbol, &mut state, &consensus, price).await?;

        // 10. Per-symbol state (streaming volatility, price window).
        state.observe_price(price);

        // 11. Budget observation; the hard deadline lives in the caller.
        self.check_soft_budget(symbol, cycle_start);
        Ok(outcome)
    }

    /// Steps 7-9: draft from consensus, append to the ledger (must succeed
    /// before distribution), then hand off to the distributor without
    /// blocking the cycle.
    async fn emit(
        &self,
        symbol: &str,
        state: &mut SymbolState,
        consensus: &Consensus,
        price: f64,
    ) -> Result<CycleOutcome, PipelineError> {
        let action = Action::from_direction(consensus.direction).ok_or_else(|| {
            PipelineError::Validation("neutral consensus cannot become a signal".to_string())
        })?;

        // generated_at is strictly monotonic per symbol within this process.
        let mut generated_at = Utc::now();
        if let Some(previous) = state.last_generated_at {
            if generated_at <= previous {
                generated_at = previous + ChronoDuration::microseconds(1);
            }
        }

        let (stop_price, target_price) = stop_and_target(
            action,
            price,
            self.config.stop_loss_pct,
            self.config.take_profit_pct,
        );

        let ctx = RationaleContext {
            symbol,
            consensus,
            regime: self.regimes.reading_for(symbol, &state.price_history()).regime,
        };
        let rationale = self
            .enricher
            .enrich(build_rationale(symbol, consensus, ctx.regime), &ctx);

        let draft = SignalDraft {
            signal_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            action,
            entry_price: price,
            confidence: consensus.confidence,
            stop_price,
            target_price,
            rationale,
            generated_at,
            regime: ctx.regime,
            source_weights: consensus.weights.clone(),
        };
        draft
            .validate(self.config.min_confidence_threshold)
            .map_err(PipelineError::Validation)?;

        // 8. Persist; failure aborts the cycle with nothing distributed.
        let signal = self.ledger.append(draft).await?;
        state.last_generated_at = Some(signal.generated_at);

        // Integrity gate: a mismatch on this very write stops distribution.
        if self.integrity.should_block_distribution(signal.chain_index) {
            tracing::error!(
                signal_id = %signal.signal_id,
                chain_index = signal.chain_index,
                "integrity failure on most recent write, distribution aborted"
            );
            return Ok(CycleOutcome::Emitted {
                signal_id: signal.signal_id,
                chain_index: signal.chain_index,
                distribution: None,
            });
        }

        // 9. Distribute; the signal is owned by the queue machinery from
        // here, so the cycle does not wait for executors.
        let distributor = Arc::clone(&self.distributor);
        let monitor = Arc::clone(&self.monitor);
        let signal_id = signal.signal_id.clone();
        let chain_index = signal.chain_index;
        let handle = tokio::spawn(async move {
            let outcomes = distributor.distribute(&signal).await;
            // Latency runs to the first accept or enqueue, whichever came
            // first; terminal rejections still close the measurement.
            let completed_at = outcomes
                .iter()
                .filter(|o| {
                    matches!(
                        o.kind,
                        OutcomeKind::Accepted { .. } | OutcomeKind::Enqueued { .. }
                    )
                })
                .map(|o| o.at)
                .min()
                .or_else(|| outcomes.iter().map(|o| o.at).min())
                .unwrap_or_else(Utc::now);
            monitor
                .record_distribution(&signal.signal_id, signal.generated_at, completed_at)
                .await;
        });

        Ok(CycleOutcome::Emitted {
            signal_id,
            chain_index,
            distribution: Some(handle),
        })
    }

    fn check_soft_budget(&self, symbol: &str, cycle_start: Instant) {
        let elapsed_ms = cycle_start.elapsed().as_millis() as u64;
        if elapsed_ms > self.config.soft_budget_signal_generation_ms {
            tracing::warn!(
                symbol,
                elapsed_ms,
                budget_ms = self.config.soft_budget_signal_generation_ms,
                "generation cycle exceeded soft budget"
            );
        }
    }
}

fn stop_and_target(
    action: Action,
    price: f64,
    stop_loss_pct: Option<f64>,
    take_profit_pct: Option<f64>,
) -> (Option<f64>, Option<f64>) {
    let stop = stop_loss_pct.map(|pct| match action {
        Action::Buy => price * (1.0 - pct / 100.0),
        Action::Sell => price * (1.0 + pct / 100.0),
    });
    let target = take_profit_pct.map(|pct| match action {
        Action::Buy => price * (1.0 + pct / 100.0),
        Action::Sell => price * (1.0 - pct / 100.0),
    });
    (stop, target)
}
