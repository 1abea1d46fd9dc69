use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;

mod health;
mod notifier;
mod paper;

use account_monitor::{AccountMonitor, SnapshotStore};
use consensus_engine::ConsensusEngine;
use executor_trait::ExecutorClient;
use latency_monitor::{IntegritySweeper, LatencyMonitor};
use notifier::WebhookNotifier;
use paper::PaperExecutor;
use queue_processor::QueueProcessor;
use regime_detector::CachedRegimeDetector;
use signal_cache::{SharedCache, SignalCacheLayer};
use signal_core::{MarketClock, PipelineConfig, SignalSource};
use signal_distributor::{Distributor, ExecutorHandle};
use signal_generator::{IdentityEnricher, SignalGenerator};
use signal_ledger::SignalLedger;
use signal_queue::SignalQueue;
use source_registry::{HttpSource, SourceRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing (text or JSON).
    dotenvy::dotenv().ok();
    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting trading signal pipeline");

    // 2. Configuration; invalid config is fatal at startup.
    let config = PipelineConfig::from_env()?;
    tracing::info!("Configuration loaded and validated");
    tracing::info!("  Symbols: {}", config.symbols.join(","));
    tracing::info!("  Tick interval: {}s", config.tick_interval_seconds);
    tracing::info!("  Min confidence: {:.0}", config.min_confidence_threshold);
    tracing::info!("  Sources: {}", config.sources.len());
    tracing::info!("  Executors: {}", config.executors.len());
    tracing::info!("  24/7 mode: {}", config.run_24_7);

    let clock = MarketClock::new(config.run_24_7);
    let notifier = Arc::new(WebhookNotifier::new(config.alert_webhook_url.clone()));

    // 3. Storage: ledger + queue share one database.
    let pool = signal_ledger::connect(&config.database_url).await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    tracing::info!("Startup check: database OK");

    let ledger = Arc::new(SignalLedger::new(pool.clone(), config.retention_seconds));
    let queue = Arc::new(SignalQueue::new(pool.clone(), config.queue.clone()));

    // 4. Sources behind rate limiting and circuit breaking.
    let mut registry = SourceRegistry::new(Duration::from_millis(config.fetch_deadline_ms));
    for source_config in &config.sources {
        match &source_config.endpoint {
            Some(endpoint) => {
                let source = HttpSource::new(
                    source_config.id.clone(),
                    source_config.style,
                    endpoint.clone(),
                )
                .map_err(|e| anyhow::anyhow!(e))?;
                registry.register(source_config, Arc::new(source) as Arc<dyn SignalSource>);
            }
            None => {
                tracing::warn!(
                    source_id = %source_config.id,
                    "source has no endpoint configured, skipping"
                );
            }
        }
    }
    if registry.is_empty() {
        anyhow::bail!("no usable data sources configured");
    }
    let registry = Arc::new(registry);
    tracing::info!("Source registry initialized ({} sources)", registry.len());

    // 5. Executors: HTTP-configured entries are expected to be wired to a
    // concrete backend adapter at deployment; entries without an endpoint
    // run against the in-process paper executor.
    let mut executor_clients: Vec<(signal_core::ExecutorConfig, Arc<dyn ExecutorClient>)> =
        Vec::new();
    for executor_config in &config.executors {
        if executor_config.endpoint.is_some() {
            tracing::warn!(
                executor_id = %executor_config.id,
                "no backend adapter linked for endpoint executors in this build, using paper"
            );
        }
        let client: Arc<dyn ExecutorClient> =
            Arc::new(PaperExecutor::new(&executor_config.id, 100_000.0));
        executor_clients.push((executor_config.clone(), client));
    }
    if executor_clients.is_empty() {
        anyhow::bail!("no executors configured");
    }

    // Startup connectivity check per executor (warn-only).
    for (executor_config, client) in &executor_clients {
        match client.account().await {
            Ok(account) => tracing::info!(
                executor_id = %executor_config.id,
                buying_power = %account.buying_power,
                paper = client.is_paper(),
                "Startup check: executor OK"
            ),
            Err(e) => tracing::warn!(
                executor_id = %executor_config.id,
                error = %e,
                "Startup check: executor unreachable"
            ),
        }
    }

    // 6. Caching, consensus, regime.
    let shared_cache = if config.cache.shared_enabled {
        match SharedCache::connect(&config.cache.redis_url).await {
            Ok(shared) => {
                tracing::info!("Shared cache tier connected");
                Some(shared)
            }
            Err(e) => {
                tracing::warn!(error = %e, "shared cache unavailable, running local-only");
                None
            }
        }
    } else {
        None
    };
    let cache = Arc::new(SignalCacheLayer::new(
        config.cache.clone(),
        clock,
        shared_cache,
    ));
    let consensus = Arc::new(ConsensusEngine::new(&config));
    let regimes = Arc::new(CachedRegimeDetector::new(config.regime.clone()));

    // 7. Distribution and the conditional-queue loop.
    let store = Arc::new(SnapshotStore::new());
    let handles: Vec<Arc<ExecutorHandle>> = executor_clients
        .iter()
        .map(|(executor_config, client)| {
            Arc::new(ExecutorHandle::new(
                executor_config.clone(),
                Arc::clone(client),
                config.distributor_workers,
                config.executor_inflight_bound,
            ))
        })
        .collect();
    let distributor = Arc::new(Distributor::new(
        handles,
        Arc::clone(&queue),
        Arc::clone(&store),
        Duration::from_millis(config.validate_timeout_ms),
        Duration::from_millis(config.submit_timeout_ms),
        Duration::from_millis(config.snapshot_timeout_ms),
    ));

    let account_monitor = Arc::new(AccountMonitor::new(
        executor_clients.clone(),
        Arc::clone(&store),
        Arc::clone(&queue),
        clock,
        Duration::from_secs(config.account_poll_interval_seconds),
        Duration::from_millis(config.snapshot_timeout_ms),
    ));

    let latency = Arc::new(LatencyMonitor::new(
        500,
        Arc::clone(&notifier) as Arc<dyn latency_monitor::AlertSink>,
    ));
    let sweeper = Arc::new(IntegritySweeper::new(
        Arc::clone(&ledger),
        Arc::clone(&notifier) as Arc<dyn latency_monitor::AlertSink>,
        Duration::from_secs(3600),
        Duration::from_secs(86_400),
    ));

    let processor = Arc::new(QueueProcessor::new(
        Arc::clone(&queue),
        Arc::clone(&ledger),
        Arc::clone(&distributor),
        Arc::clone(&store),
        Duration::from_secs(config.queue_max_sleep_seconds),
        Duration::from_millis(config.queue.retry_base_ms),
        Duration::from_millis(config.queue.retry_cap_ms),
    ));

    // 8. The generator.
    let generator = Arc::new(SignalGenerator::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&cache),
        consensus,
        regimes,
        Arc::clone(&ledger),
        Arc::clone(&distributor),
        Arc::clone(&latency),
        Arc::clone(&sweeper),
        Arc::new(IdentityEnricher),
    ));

    // 9. Launch background workers.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handles = Vec::new();
    worker_handles.extend(Arc::clone(&account_monitor).spawn(shutdown_rx.clone()));
    worker_handles.extend(Arc::clone(&processor).spawn(shutdown_rx.clone()));
    worker_handles.push(Arc::clone(&sweeper).spawn(shutdown_rx.clone()));
    Arc::clone(&generator).start().await;

    // 10. Health endpoint.
    let app_state = Arc::new(health::AppState {
        generator: Arc::clone(&generator),
        registry: Arc::clone(&registry),
        queue: Arc::clone(&queue),
        store: Arc::clone(&store),
        monitor: Arc::clone(&latency),
        sweeper: Arc::clone(&sweeper),
        executor_ids: distributor.executor_ids(),
        started_at: Utc::now(),
    });
    let listener = tokio::net::TcpListener::bind(&config.health_bind_addr).await?;
    tracing::info!("Health endpoint on {}", config.health_bind_addr);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health::router(app_state)).await {
            tracing::error!(error = %e, "health server exited");
        }
    });

    notifier
        .send_message(&format!(
            "**Signal pipeline started** | {} symbols | {} sources | {} executors | tick {}s",
            config.symbols.len(),
            config.sources.len(),
            config.executors.len(),
            config.tick_interval_seconds
        ))
        .await;

    // 11. Run until SIGINT/SIGTERM, then drain within the grace deadline.
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }

    tracing::info!("Shutdown signal received, stopping...");
    generator.stop().await;
    let _ = shutdown_tx.send(true);
    let grace = Duration::from_secs(config.stop_grace_seconds);
    for handle in worker_handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            tracing::warn!("worker did not stop within grace deadline");
        }
    }
    server.abort();
    latency.log_summary();

    notifier
        .send_message("**Signal pipeline stopped** - graceful shutdown")
        .await;
    tracing::info!("Signal pipeline shut down.");
    Ok(())
}
