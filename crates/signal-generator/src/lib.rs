pub mod rationale;
pub mod state;

mod cycle;

pub use cycle::CycleOutcome;
pub use rationale::{build_rationale, IdentityEnricher, RationaleContext, RationaleEnricher};
pub use state::{StreamingVolatility, SymbolState};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use consensus_engine::ConsensusEngine;
use latency_monitor::{IntegritySweeper, LatencyMonitor};
use regime_detector::CachedRegimeDetector;
use signal_cache::SignalCacheLayer;
use signal_core::{MarketClock, PipelineConfig};
use signal_distributor::Distributor;
use signal_ledger::SignalLedger;
use source_registry::SourceRegistry;

/// Live view of the scheduler, for the status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct GeneratorStatus {
    pub running: bool,
    pub symbols: usize,
    pub counters: serde_json::Value,
}

struct RunningState {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// The scheduler: one tick every `tick_interval_seconds` runs a generation
/// cycle for every configured symbol under bounded parallelism. Cycles for
/// the same symbol never overlap; a failed cycle never aborts the tick.
pub struct SignalGenerator {
    pub(crate) config: PipelineConfig,
    pub(crate) clock: MarketClock,
    pub(crate) registry: Arc<SourceRegistry>,
    pub(crate) cache: Arc<SignalCacheLayer>,
    pub(crate) consensus: Arc<ConsensusEngine>,
    pub(crate) regimes: Arc<CachedRegimeDetector>,
    pub(crate) ledger: Arc<SignalLedger>,
    pub(crate) distributor: Arc<Distributor>,
    pub(crate) monitor: Arc<LatencyMonitor>,
    pub(crate) integrity: Arc<IntegritySweeper>,
    pub(crate) enricher: Arc<dyn RationaleEnricher>,
    pub(crate) states: DashMap<String, Arc<Mutex<SymbolState>>>,
    fan_out: Arc<Semaphore>,
    running: Mutex<Option<RunningState>>,
}

impl SignalGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        registry: Arc<SourceRegistry>,
        cache: Arc<SignalCacheLayer>,
        consensus: Arc<ConsensusEngine>,
        regimes: Arc<CachedRegimeDetector>,
        ledger: Arc<SignalLedger>,
        distributor: Arc<Distributor>,
        monitor: Arc<LatencyMonitor>,
        integrity: Arc<IntegritySweeper>,
        enricher: Arc<dyn RationaleEnricher>,
    ) -> Self {
        let clock = MarketClock::new(config.run_24_7);
        let fan_out = Arc::new(Semaphore::new(config.fan_out_limit.max(1)));
        Self {
            config,
            clock,
            registry,
            cache,
            consensus,
            regimes,
            ledger,
            distributor,
            monitor,
            integrity,
            enricher,
            states: DashMap::new(),
            fan_out,
            running: Mutex::new(None),
        }
    }

    /// Launch the scheduler and the periodic cache-maintenance task.
    /// Idempotent: a second call while running is a no-op.
    pub async fn start(self: Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::warn!("generator already running, start ignored");
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        // Tick scheduler.
        {
            let generator = Arc::clone(&self);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(generator.config.tick_interval_seconds));
                // A long tick starts the next one immediately, without
                // piling up further backlog.
                interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            Arc::clone(&generator).run_tick(&shutdown).await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        // Cache maintenance.
        {
            let generator = Arc::clone(&self);
            let mut shutdown = shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(
                    generator.config.maintenance_interval_seconds,
                ));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            generator.cache.trim();
                            tracing::debug!(
                                local_entries = generator.cache.local_entries(),
                                "cache maintenance pass complete"
                            );
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }));
        }

        *running = Some(RunningState {
            shutdown_tx,
            handles,
        });
        tracing::info!(
            symbols = self.config.symbols.len(),
            tick_seconds = self.config.tick_interval_seconds,
            fan_out = self.config.fan_out_limit,
            "signal generator started"
        );
    }

    /// Stop the scheduler, waiting up to the grace deadline for in-flight
    /// cycles. Idempotent.
    pub async fn stop(&self) {
        let state = {
            let mut running = self.running.lock().await;
            running.take()
        };
        let Some(state) = state else {
            return;
        };
        let _ = state.shutdown_tx.send(true);

        let grace = Duration::from_secs(self.config.stop_grace_seconds);
        for handle in state.handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                tracing::warn!("generator task did not stop within grace deadline");
            }
        }
        tracing::info!("signal generator stopped");
    }

    pub async fn status(&self) -> GeneratorStatus {
        GeneratorStatus {
            running: self.running.lock().await.is_some(),
            symbols: self.config.symbols.len(),
            counters: self.monitor.counters(),
        }
    }

    /// One tick: spawn a cycle per symbol on the bounded pool. Per-symbol
    /// overlap is prevented inside the cycle with a try-lock.
    async fn run_tick(self: Arc<Self>, shutdown: &watch::Receiver<bool>) {
        for symbol in self.config.symbols.clone() {
            if *shutdown.borrow() {
                return;
            }
            let permit = match Arc::clone(&self.fan_out).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let generator = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                generator.run_symbol(&symbol).await;
            });
        }
    }

    /// Run one symbol's cycle under the hard deadline, recording outcome
    /// counters. Never propagates errors into the tick.
    pub async fn run_symbol(self: Arc<Self>, symbol: &str) {
        let hard_deadline =
            Duration::from_millis(self.config.soft_budget_signal_generation_ms * 2);
        self.monitor.cycles_run.fetch_add(1, Ordering::Relaxed);

        let result = tokio::time::timeout(hard_deadline, self.run_cycle(symbol)).await;
        match result {
            Ok(Ok(CycleOutcome::Emitted { signal_id, chain_index, .. })) => {
                self.monitor.signals_emitted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(symbol, %signal_id, chain_index, "signal emitted");
            }
            Ok(Ok(CycleOutcome::NoSignal { reason })) => {
                self.monitor.cycles_aborted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(symbol, reason, "cycle produced no signal");
            }
            Ok(Ok(CycleOutcome::Skipped { reason })) => {
                tracing::trace!(symbol, reason, "cycle skipped");
            }
            Ok(Err(e)) => {
                self.monitor.cycle_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(symbol, error = %e, "cycle failed");
            }
            Err(_) => {
                // Hard deadline: partial fetches are dropped with the future.
                self.monitor.cycle_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    symbol,
                    deadline_ms = hard_deadline.as_millis() as u64,
                    "cycle cancelled at hard deadline"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests;
