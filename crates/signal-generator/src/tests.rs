use super::*;
use crate::cycle::CycleOutcome;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use executor_trait::{
    ExecutorAccount, ExecutorClient, ExecutorError, ExecutorPosition, SignalOrder, SubmitOutcome,
    ValidateOutcome,
};
use latency_monitor::TracingAlertSink;
use signal_core::{
    Action, CacheConfig, Direction, ExecutorConfig, QueueConfig, RegimeConfig, SignalSource,
    SourceConfig, SourceError, SourceSignal, SourceStyle,
};
use signal_distributor::ExecutorHandle;
use signal_queue::SignalQueue;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

/// Source returning a fixed signal, counting calls.
struct StaticSource {
    id: String,
    style: SourceStyle,
    direction: Direction,
    confidence: f64,
    price: Option<f64>,
    staleness_seconds: Option<i64>,
    fail: bool,
    calls: AtomicU32,
}

impl StaticSource {
    fn new(id: &str, style: SourceStyle, direction: Direction, confidence: f64) -> Self {
        Self {
            id: id.to_string(),
            style,
            direction,
            confidence,
            price: Some(190.0),
            staleness_seconds: Some(0),
            fail: false,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl SignalSource for StaticSource {
    fn source_id(&self) -> &str {
        &self.id
    }
    fn style(&self) -> SourceStyle {
        self.style
    }
    async fn fetch(&self, symbol: &str) -> Result<SourceSignal, SourceError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        if self.fail {
            return Err(SourceError::Upstream("down".to_string()));
        }
        Ok(SourceSignal {
            source_id: self.id.clone(),
            symbol: symbol.to_string(),
            direction: self.direction,
            confidence: self.confidence,
            price: self.price,
            as_of: self
                .staleness_seconds
                .map(|s| Utc::now() - ChronoDuration::seconds(s)),
        })
    }
}

struct AcceptingExecutor;

#[async_trait]
impl ExecutorClient for AcceptingExecutor {
    fn executor_id(&self) -> &str {
        "ex1"
    }
    fn is_paper(&self) -> bool {
        true
    }
    async fn validate(&self, _order: &SignalOrder) -> Result<ValidateOutcome, ExecutorError> {
        Ok(ValidateOutcome::Ok)
    }
    async fn submit(&self, _order: &SignalOrder) -> Result<SubmitOutcome, ExecutorError> {
        Ok(SubmitOutcome::Accepted {
            broker_order_id: "order-1".to_string(),
        })
    }
    async fn account(&self) -> Result<ExecutorAccount, ExecutorError> {
        Ok(ExecutorAccount {
            id: "ex1".to_string(),
            status: "ACTIVE".to_string(),
            currency: "USD".to_string(),
            buying_power: "100000".to_string(),
            cash: "100000".to_string(),
            portfolio_value: "100000".to_string(),
            trading_blocked: false,
        })
    }
    async fn positions(&self) -> Result<Vec<ExecutorPosition>, ExecutorError> {
        Ok(Vec::new())
    }
}

struct Fixture {
    generator: Arc<SignalGenerator>,
    ledger: Arc<SignalLedger>,
    queue: Arc<SignalQueue>,
    sources: Vec<Arc<StaticSource>>,
}

fn source_config(id: &str, weight: f64, style: SourceStyle) -> SourceConfig {
    SourceConfig {
        id: id.to_string(),
        weight,
        style,
        rate_limit_rpm: 600,
        circuit_fail_threshold: 5,
        circuit_cooldown_seconds: 30,
        endpoint: None,
    }
}

async fn fixture(sources: Vec<StaticSource>) -> Fixture {
    let source_configs: Vec<SourceConfig> = sources
        .iter()
        .map(|s| source_config(&s.id, 1.0 / sources.len() as f64, s.style))
        .collect();
    fixture_with_weights(sources, source_configs).await
}

async fn fixture_with_weights(
    sources: Vec<StaticSource>,
    source_configs: Vec<SourceConfig>,
) -> Fixture {
    let config = PipelineConfig {
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
        stop_loss_pct: Some(2.0),
        take_profit_pct: Some(4.0),
        sources: source_configs,
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
    };

    let pool = signal_ledger::connect(&config.database_url).await.unwrap();
    let ledger = Arc::new(SignalLedger::new(pool.clone(), config.retention_seconds));
    let queue = Arc::new(SignalQueue::new(pool, config.queue.clone()));
    let store = Arc::new(account_monitor::SnapshotStore::new());

    let mut registry = SourceRegistry::new(Duration::from_millis(config.fetch_deadline_ms));
    let sources: Vec<Arc<StaticSource>> = sources.into_iter().map(Arc::new).collect();
    for (source, cfg) in sources.iter().zip(config.sources.iter()) {
        registry.register(cfg, Arc::clone(source) as Arc<dyn SignalSource>);
    }

    let handle = Arc::new(ExecutorHandle::new(
        config.executors[0].clone(),
        Arc::new(AcceptingExecutor) as Arc<dyn ExecutorClient>,
        config.distributor_workers,
        config.executor_inflight_bound,
    ));
    let distributor = Arc::new(Distributor::new(
        vec![handle],
        Arc::clone(&queue),
        store,
        Duration::from_millis(config.validate_timeout_ms),
        Duration::from_millis(config.submit_timeout_ms),
        Duration::from_millis(config.snapshot_timeout_ms),
    ));
    let monitor = Arc::new(LatencyMonitor::new(500, Arc::new(TracingAlertSink)));
    let integrity = Arc::new(IntegritySweeper::new(
        Arc::clone(&ledger),
        Arc::new(TracingAlertSink),
        Duration::from_secs(3600),
        Duration::from_secs(86_400),
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
        monitor,
        integrity,
        Arc::new(IdentityEnricher),
    ));

    Fixture {
        generator,
        ledger,
        queue,
        sources,
    }
}

async fn emitted(outcome: CycleOutcome) -> (String, i64) {
    match outcome {
        CycleOutcome::Emitted {
            signal_id,
            chain_index,
            distribution,
        } => {
            if let Some(handle) = distribution {
                handle.await.unwrap();
            }
            (signal_id, chain_index)
        }
        other => panic!("expected emission, got {other:?}"),
    }
}

#[tokio::test]
async fn agreeing_sources_emit_a_buy_signal() {
    let f = fixture(vec![
        StaticSource::new("m", SourceStyle::Momentum, Direction::Long, 90.0),
        StaticSource::new("a", SourceStyle::Sentiment, Direction::Long, 80.0),
    ])
    .await;

    let outcome = f.generator.run_cycle("AAPL").await.unwrap();
    let (signal_id, chain_index) = emitted(outcome).await;
    assert_eq!(chain_index, 1);

    let signal = f.ledger.get(&signal_id).await.unwrap().unwrap();
    assert_eq!(signal.action, Action::Buy);
    assert!(signal.confidence >= 75.0);
    assert!(signal.rationale.len() >= 20);
    assert!((signal.stop_price.unwrap() - 190.0 * 0.98).abs() < 1e-9);
    assert!((signal.target_price.unwrap() - 190.0 * 1.04).abs() < 1e-9);

    // Accepted by the executor: nothing queued, latency recorded.
    assert!(f.queue.pending_for("ex1").await.unwrap().is_empty());
    assert_eq!(f.generator.monitor.summary().samples, 1);
}

#[tokio::test]
async fn opposed_sources_produce_no_signal() {
    let f = fixture(vec![
        StaticSource::new("m", SourceStyle::Momentum, Direction::Long, 80.0),
        StaticSource::new("a", SourceStyle::Momentum, Direction::Short, 80.0),
    ])
    .await;

    let outcome = f.generator.run_cycle("AAPL").await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::NoSignal {
            reason: "neutral consensus"
        }
    ));
    assert_eq!(f.ledger.max_chain_index().await.unwrap(), 0);
}

#[tokio::test]
async fn weak_consensus_fails_the_confidence_gate() {
    let f = fixture(vec![StaticSource::new(
        "m",
        SourceStyle::Momentum,
        Direction::Long,
        55.0,
    )])
    .await;

    let outcome = f.generator.run_cycle("AAPL").await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::NoSignal {
            reason: "below confidence threshold"
        }
    ));
    assert_eq!(f.ledger.max_chain_index().await.unwrap(), 0);
}

#[tokio::test]
async fn stale_sources_are_dropped_before_consensus() {
    let mut stale = StaticSource::new("m", SourceStyle::Momentum, Direction::Long, 90.0);
    stale.staleness_seconds = Some(1_200); // past the 600s cutoff
    let fresh = StaticSource::new("a", SourceStyle::Sentiment, Direction::Short, 80.0);

    let f = fixture(vec![stale, fresh]).await;
    let outcome = f.generator.run_cycle("AAPL").await.unwrap();
    let (signal_id, _) = emitted(outcome).await;

    // Only the fresh SHORT survived.
    let signal = f.ledger.get(&signal_id).await.unwrap().unwrap();
    assert_eq!(signal.action, Action::Sell);
    assert_eq!(signal.source_weights.len(), 1);
    assert!(signal.source_weights.contains_key("a"));
}

#[tokio::test]
async fn exhausted_sources_abort_with_no_partial_write() {
    let mut down_a = StaticSource::new("m", SourceStyle::Momentum, Direction::Long, 90.0);
    down_a.fail = true;
    let mut down_b = StaticSource::new("a", SourceStyle::Sentiment, Direction::Long, 80.0);
    down_b.fail = true;

    let f = fixture(vec![down_a, down_b]).await;
    let outcome = f.generator.run_cycle("AAPL").await.unwrap();
    assert!(matches!(
        outcome,
        CycleOutcome::NoSignal {
            reason: "no usable sources"
        }
    ));
    assert_eq!(f.ledger.max_chain_index().await.unwrap(), 0);
    assert_eq!(
        f.generator
            .monitor
            .cycles_exhausted_sources
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[tokio::test]
async fn unchanged_price_reuses_cached_consensus_without_fetching() {
    let f = fixture(vec![
        StaticSource::new("m", SourceStyle::Momentum, Direction::Long, 90.0),
        StaticSource::new("a", SourceStyle::Sentiment, Direction::Long, 80.0),
    ])
    .await;

    let first = f.generator.run_cycle("AAPL").await.unwrap();
    let (_, first_index) = emitted(first).await;
    assert_eq!(first_index, 1);
    let calls_after_first: u32 = f.sources.iter().map(|s| s.calls()).sum();

    let second = f.generator.run_cycle("AAPL").await.unwrap();
    let (_, second_index) = emitted(second).await;
    assert_eq!(second_index, 2);
    // Early exit: no further upstream calls.
    let calls_after_second: u32 = f.sources.iter().map(|s| s.calls()).sum();
    assert_eq!(calls_after_first, calls_after_second);

    // generated_at stays strictly monotonic per symbol.
    let signals = f.ledger.latest("AAPL", 2).await.unwrap();
    assert!(signals[0].generated_at > signals[1].generated_at);
}
