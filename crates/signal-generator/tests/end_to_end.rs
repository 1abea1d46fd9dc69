//! Full-loop scenarios: generate -> persist -> distribute -> queue ->
//! account change -> promote -> re-submit.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use account_monitor::{AccountMonitor, SnapshotStore};
use consensus_engine::ConsensusEngine;
use executor_trait::{
    ExecutorAccount, ExecutorClient, ExecutorError, ExecutorPosition, RejectReason, SignalOrder,
    SubmitOutcome, ValidateOutcome,
};
use latency_monitor::{IntegritySweeper, LatencyMonitor, TracingAlertSink};
use queue_processor::QueueProcessor;
use regime_detector::CachedRegimeDetector;
use rust_decimal::Decimal;
use signal_cache::SignalCacheLayer;
use signal_core::{
    CacheConfig, Condition, Direction, ExecutorConfig, MarketClock, PipelineConfig, QueueConfig,
    QueueStatus, RegimeConfig, SignalSource, SourceConfig, SourceError, SourceSignal, SourceStyle,
};
use signal_distributor::{Distributor, ExecutorHandle};
use signal_generator::{CycleOutcome, IdentityEnricher, SignalGenerator};
use signal_ledger::{ChainVerification, SignalLedger};
use signal_queue::SignalQueue;
use source_registry::SourceRegistry;

struct StaticSource {
    id: String,
    direction: Direction,
    confidence: f64,
}

#[async_trait]
impl SignalSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.id
    }
    fn style(&self) -> SourceStyle {
        SourceStyle::Momentum
    }
    async fn fetch(&self, symbol: &str) -> Result<SourceSignal, SourceError> {
        Ok(SourceSignal {
            source_id: self.id.clone(),
            symbol: symbol.to_string(),
            direction: self.direction,
            confidence: self.confidence,
            price: Some(190.0),
            as_of: Some(Utc::now()),
        })
    }
}

/// Broker stub whose account state tests mutate mid-scenario.
struct MutableExecutor {
    id: String,
    buying_power: Mutex<f64>,
    positions: Mutex<Vec<ExecutorPosition>>,
    submits: AtomicU32,
}

impl MutableExecutor {
    fn new(id: &str, buying_power: f64) -> Self {
        Self {
            id: id.to_string(),
            buying_power: Mutex::new(buying_power),
            positions: Mutex::new(Vec::new()),
            submits: AtomicU32::new(0),
        }
    }

    fn set_buying_power(&self, v: f64) {
        *self.buying_power.lock().unwrap() = v;
    }

    fn hold_long(&self, symbol: &str) {
        self.positions.lock().unwrap().push(ExecutorPosition {
            symbol: symbol.to_string(),
            side: "long".to_string(),
            qty: "100".to_string(),
            avg_entry_price: "180.00".to_string(),
            market_value: "18000.00".to_string(),
            unrealized_pl: "0".to_string(),
        });
    }

    fn flatten(&self) {
        self.positions.lock().unwrap().clear();
    }

    fn needed(&self) -> f64 {
        19_000.0
    }
}

#[async_trait]
impl ExecutorClient for MutableExecutor {
    fn executor_id(&self) -> &str {
        &self.id
    }
    fn is_paper(&self) -> bool {
        true
    }
    async fn validate(&self, order: &SignalOrder) -> Result<ValidateOutcome, ExecutorError> {
        let holds = self
            .positions
            .lock()
            .unwrap()
            .iter()
            .any(|p| p.symbol == order.symbol);
        if !holds && *self.buying_power.lock().unwrap() < self.needed() {
            return Ok(ValidateOutcome::Reject {
                reason: RejectReason::InsufficientBuyingPower {
                    required: Decimal::from_f64_retain(self.needed()).unwrap_or_default(),
                },
                message: "INSUFFICIENT_BUYING_POWER".to_string(),
            });
        }
        Ok(ValidateOutcome::Ok)
    }
    async fn submit(&self, _order: &SignalOrder) -> Result<SubmitOutcome, ExecutorError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(SubmitOutcome::Accepted {
            broker_order_id: "order-e2e".to_string(),
        })
    }
    async fn account(&self) -> Result<ExecutorAccount, ExecutorError> {
        Ok(ExecutorAccount {
            id: self.id.clone(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: format!("{:.2}", *self.buying_power.lock().unwrap()),
            cash: format!("{:.2}", *self.buying_power.lock().unwrap()),
            portfolio_value: "100000.00".to_string(),
            trading_blocked: false,
        })
    }
    async fn positions(&self) -> Result<Vec<ExecutorPosition>, ExecutorError> {
        Ok(self.positions.lock().unwrap().clone())
    }
}

struct Pipeline {
    generator: Arc<SignalGenerator>,
    ledger: Arc<SignalLedger>,
    queue: Arc<SignalQueue>,
    monitor: Arc<AccountMonitor>,
    processor: Arc<QueueProcessor>,
    executor: Arc<MutableExecutor>,
}

fn base_config() -> PipelineConfig {
    PipelineConfig {
        symbols: vec!["AAPL".to_string()],
        tick_interval_seconds: 5,
        min_confidence_threshold: 75.0,
        max_staleness_seconds: 600,
        price_change_threshold_pct: 0.1,
        soft_budget_signal_generation_ms: 10_000,
        soft_budget_data_source_fetch_ms: 5_000,
        fetch_deadline_ms: 4_000,
        agreement_floor: 0.15,
        agreement_bonus: 0.10,
        retention_seconds: 220_752_000,
        run_24_7: true,
        stop_loss_pct: None,
        take_profit_pct: None,
        sources: vec![
            SourceConfig {
                id: "m".to_string(),
                weight: 0.6,
                style: SourceStyle::Momentum,
                rate_limit_rpm: 600,
                circuit_fail_threshold: 5,
                circuit_cooldown_seconds: 30,
                endpoint: None,
            },
            SourceConfig {
                id: "a".to_string(),
                weight: 0.4,
                style: SourceStyle::Sentiment,
                rate_limit_rpm: 600,
                circuit_fail_threshold: 5,
                circuit_cooldown_seconds: 30,
                endpoint: None,
            },
        ],
        executors: vec![ExecutorConfig::new("ex1")],
        queue: QueueConfig::default(),
        cache: CacheConfig::default(),
        regime: RegimeConfig::default(),
        fan_out_limit: 8,
        distributor_workers: 4,
        executor_inflight_bound: 1024,
        account_poll_interval_seconds: 60,
        queue_max_sleep_seconds: 30,
        stop_grace_seconds: 30,
        maintenance_interval_seconds: 300,
        validate_timeout_ms: 2_000,
        submit_timeout_ms: 5_000,
        snapshot_timeout_ms: 5_000,
        database_url: "sqlite::memory:".to_string(),
        health_bind_addr: "127.0.0.1:0".to_string(),
        alert_webhook_url: None,
    }
}

async fn pipeline(executor: Arc<MutableExecutor>) -> Pipeline {
    let config = base_config();
    let pool = signal_ledger::connect(&config.database_url).await.unwrap();
    let ledger = Arc::new(SignalLedger::new(pool.clone(), config.retention_seconds));
    let queue = Arc::new(SignalQueue::new(pool, config.queue.clone()));
    let store = Arc::new(SnapshotStore::new());

    let mut registry = SourceRegistry::new(Duration::from_millis(config.fetch_deadline_ms));
    registry.register(
        &config.sources[0],
        Arc::new(StaticSource {
            id: "m".to_string(),
            direction: Direction::Long,
            confidence: 90.0,
        }) as Arc<dyn SignalSource>,
    );
    registry.register(
        &config.sources[1],
        Arc::new(StaticSource {
            id: "a".to_string(),
            direction: Direction::Long,
            confidence: 80.0,
        }) as Arc<dyn SignalSource>,
    );

    let handle = Arc::new(ExecutorHandle::new(
        config.executors[0].clone(),
        Arc::clone(&executor) as Arc<dyn ExecutorClient>,
        config.distributor_workers,
        config.executor_inflight_bound,
    ));
    let distributor = Arc::new(Distributor::new(
        vec![handle],
        Arc::clone(&queue),
        Arc::clone(&store),
        Duration::from_millis(config.validate_timeout_ms),
        Duration::from_millis(config.submit_timeout_ms),
        Duration::from_millis(config.snapshot_timeout_ms),
    ));
    let latency = Arc::new(LatencyMonitor::new(500, Arc::new(TracingAlertSink)));
    let sweeper = Arc::new(IntegritySweeper::new(
        Arc::clone(&ledger),
        Arc::new(TracingAlertSink),
        Duration::from_secs(3600),
        Duration::from_secs(86_400),
    ));

    let monitor = Arc::new(AccountMonitor::new(
        vec![(
            config.executors[0].clone(),
            Arc::clone(&executor) as Arc<dyn ExecutorClient>,
        )],
        Arc::clone(&store),
        Arc::clone(&queue),
        MarketClock::new(true),
        Duration::from_secs(config.account_poll_interval_seconds),
        Duration::from_millis(config.snapshot_timeout_ms),
    ));
    let processor = Arc::new(QueueProcessor::new(
        Arc::clone(&queue),
        Arc::clone(&ledger),
        Arc::clone(&distributor),
        Arc::clone(&store),
        Duration::from_secs(config.queue_max_sleep_seconds),
        Duration::from_millis(1),
        Duration::from_millis(50),
    ));

    let generator = Arc::new(SignalGenerator::new(
        config.clone(),
        Arc::new(registry),
        Arc::new(SignalCacheLayer::new(
            config.cache.clone(),
            MarketClock::new(true),
            None,
        )),
        Arc::new(ConsensusEngine::new(&config)),
        Arc::new(CachedRegimeDetector::new(config.regime.clone())),
        Arc::clone(&ledger),
        distributor,
        latency,
        sweeper,
        Arc::new(IdentityEnricher),
    ));

    Pipeline {
        generator,
        ledger,
        queue,
        monitor,
        processor,
        executor,
    }
}

async fn emit_and_settle(p: &Pipeline) -> String {
    match p.generator.run_cycle("AAPL").await.unwrap() {
        CycleOutcome::Emitted {
            signal_id,
            distribution,
            ..
        } => {
            if let Some(handle) = distribution {
                handle.await.unwrap();
            }
            signal_id
        }
        other => panic!("expected emission, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_signal_waits_for_funds_then_executes_exactly_once() {
    let executor = Arc::new(MutableExecutor::new("ex1", 0.0));
    let p = pipeline(Arc::clone(&executor)).await;

    // Signal persists, executor rejects on buying power, entry goes pending.
    let signal_id = emit_and_settle(&p).await;
    let pending = p.queue.pending_for("ex1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].signal_id, signal_id);
    assert!(matches!(
        pending[0].conditions[0],
        Condition::NeedsBuyingPower { .. }
    ));

    // Still underfunded: a poll changes nothing.
    p.monitor.poll_once(0).await;
    assert_eq!(
        p.queue.get(&pending[0].queue_id).await.unwrap().unwrap().status,
        QueueStatus::Pending
    );

    // Funds arrive; the monitor promotes and the processor drains.
    executor.set_buying_power(200_000.0);
    p.monitor.poll_once(0).await;
    assert_eq!(
        p.queue.get(&pending[0].queue_id).await.unwrap().unwrap().status,
        QueueStatus::Ready
    );

    p.processor.drain("ex1").await;
    assert_eq!(
        p.queue.get(&pending[0].queue_id).await.unwrap().unwrap().status,
        QueueStatus::Executed
    );
    assert_eq!(executor.submits.load(Ordering::SeqCst), 1);

    // The ledger stayed append-only and verifiable throughout.
    assert!(matches!(
        p.ledger.verify_chain(1, None).await.unwrap(),
        ChainVerification::Ok { .. }
    ));
}

#[tokio::test]
async fn duplicate_waits_for_external_close_then_executes() {
    let executor = Arc::new(MutableExecutor::new("ex1", 200_000.0));
    executor.hold_long("AAPL");
    let p = pipeline(Arc::clone(&executor)).await;

    // Existing LONG + BUY consensus: pre-flight queues without any RPC.
    emit_and_settle(&p).await;
    let pending = p.queue.pending_for("ex1").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert!(matches!(
        pending[0].conditions[0],
        Condition::NeedsNoDuplicate { .. }
    ));
    assert_eq!(executor.submits.load(Ordering::SeqCst), 0);

    // Position closed externally; the next snapshot clears the condition.
    executor.flatten();
    p.monitor.poll_once(0).await;
    p.processor.drain("ex1").await;
    assert_eq!(
        p.queue.get(&pending[0].queue_id).await.unwrap().unwrap().status,
        QueueStatus::Executed
    );
    assert_eq!(executor.submits.load(Ordering::SeqCst), 1);
}
