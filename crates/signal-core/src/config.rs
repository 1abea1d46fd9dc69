use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;

use crate::types::SourceStyle;

/// One configured data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Base consensus weight before regime adjustment; normalized at load.
    pub weight: f64,
    #[serde(default = "default_style")]
    pub style: SourceStyle,
    #[serde(default = "default_rate_limit_rpm")]
    pub rate_limit_rpm: u32,
    #[serde(default = "default_circuit_fail_threshold")]
    pub circuit_fail_threshold: u32,
    #[serde(default = "default_circuit_cooldown_seconds")]
    pub circuit_cooldown_seconds: u64,
    /// JSON endpoint for the HTTP reference adapter; in-process sources
    /// (tests, embedded models) leave this unset.
    #[serde(default)]
    pub endpoint: Option<String>,
}

fn default_style() -> SourceStyle {
    SourceStyle::Momentum
}
fn default_rate_limit_rpm() -> u32 {
    60
}
fn default_circuit_fail_threshold() -> u32 {
    5
}
fn default_circuit_cooldown_seconds() -> u64 {
    30
}

/// A named basket of correlated symbols subject to a shared position cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationGroup {
    pub name: String,
    pub symbols: Vec<String>,
}

/// One configured trade-execution backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub id: String,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Empty means all symbols allowed.
    #[serde(default)]
    pub allowed_symbols: Vec<String>,
    #[serde(default)]
    pub restricted_symbols: Vec<String>,
    #[serde(default)]
    pub correlation_groups: Vec<CorrelationGroup>,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_per_group")]
    pub max_per_group: usize,
    /// Base URL for the HTTP reference adapter; stub executors leave it unset.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_secret: Option<String>,
}

fn default_min_confidence() -> f64 {
    75.0
}
fn default_max_positions() -> usize {
    10
}
fn default_max_per_group() -> usize {
    3
}

impl ExecutorConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            min_confidence: default_min_confidence(),
            allowed_symbols: Vec::new(),
            restricted_symbols: Vec::new(),
            correlation_groups: Vec::new(),
            max_positions: default_max_positions(),
            max_per_group: default_max_per_group(),
            endpoint: None,
            api_key: None,
            api_secret: None,
        }
    }

    pub fn symbol_allowed(&self, symbol: &str) -> bool {
        if self.restricted_symbols.iter().any(|s| s == symbol) {
            return false;
        }
        self.allowed_symbols.is_empty() || self.allowed_symbols.iter().any(|s| s == symbol)
    }
}

/// Conditional-queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub default_ttl_seconds: i64,
    pub max_attempts: i64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
            max_attempts: 3,
            retry_base_ms: 500,
            retry_cap_ms: 10_000,
        }
    }
}

/// Two-tier cache tuning, including the adaptive TTL policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub local_max_entries: usize,
    pub shared_enabled: bool,
    pub redis_url: String,
    pub ttl_closed_seconds: u64,
    pub ttl_low_vol_seconds: u64,
    pub ttl_normal_seconds: u64,
    pub ttl_high_vol_seconds: u64,
    /// Daily volatility (sigma, percent) below which TTL stretches.
    pub low_vol_threshold_pct: f64,
    /// Daily volatility (sigma, percent) above which TTL shrinks.
    pub high_vol_threshold_pct: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_max_entries: 10_000,
            shared_enabled: false,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            ttl_closed_seconds: 300,
            ttl_low_vol_seconds: 30,
            ttl_normal_seconds: 10,
            ttl_high_vol_seconds: 3,
            low_vol_threshold_pct: 1.0,
            high_vol_threshold_pct: 3.0,
        }
    }
}

/// Regime-detector tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub short_ma: usize,
    pub long_ma: usize,
    pub high_vol_threshold_pct: f64,
    /// Minimum short/long MA gap (percent of long MA) to call a trend.
    pub ma_gap_epsilon_pct: f64,
    pub cache_max_entries: usize,
    pub cache_ttl_seconds: i64,
    /// A price move of at least this much (percent) invalidates the cached regime.
    pub invalidate_move_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            short_ma: 20,
            long_ma: 50,
            high_vol_threshold_pct: 3.0,
            ma_gap_epsilon_pct: 0.25,
            cache_max_entries: 500,
            cache_ttl_seconds: 300,
            invalidate_move_pct: 1.0,
        }
    }
}

/// Full recognized configuration surface. Every scalar can be overridden by
/// an environment variable; list-valued options come from comma-separated or
/// JSON env vars.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub tick_interval_seconds: u64,
    pub min_confidence_threshold: f64,
    pub max_staleness_seconds: i64,
    pub price_change_threshold_pct: f64,
    pub soft_budget_signal_generation_ms: u64,
    pub soft_budget_data_source_fetch_ms: u64,
    /// Per-source fetch deadline; the stage soft budget covers the fan-out.
    pub fetch_deadline_ms: u64,
    pub agreement_floor: f64,
    pub agreement_bonus: f64,
    pub retention_seconds: i64,
    /// Disables market-hours gating entirely (crypto symbols).
    pub run_24_7: bool,
    /// Stop distance as a percent of entry; unset emits no stop price.
    pub stop_loss_pct: Option<f64>,
    /// Target distance as a percent of entry; unset emits no target price.
    pub take_profit_pct: Option<f64>,

    pub sources: Vec<SourceConfig>,
    pub executors: Vec<ExecutorConfig>,
    pub queue: QueueConfig,
    pub cache: CacheConfig,
    pub regime: RegimeConfig,

    // Concurrency and cadence
    pub fan_out_limit: usize,
    pub distributor_workers: usize,
    pub executor_inflight_bound: usize,
    pub account_poll_interval_seconds: u64,
    pub queue_max_sleep_seconds: u64,
    pub stop_grace_seconds: u64,
    pub maintenance_interval_seconds: u64,

    // Executor RPC deadlines
    pub validate_timeout_ms: u64,
    pub submit_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,

    // Process surface
    pub database_url: String,
    pub health_bind_addr: String,
    pub alert_webhook_url: Option<String>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "AAPL,MSFT,BTC-USD".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let sources: Vec<SourceConfig> = match env::var("SOURCES_CONFIG") {
            Ok(json) => serde_json::from_str(&json).context("parsing SOURCES_CONFIG")?,
            Err(_) => Vec::new(),
        };

        let executors: Vec<ExecutorConfig> = match env::var("EXECUTORS_CONFIG") {
            Ok(json) => serde_json::from_str(&json).context("parsing EXECUTORS_CONFIG")?,
            Err(_) => Vec::new(),
        };

        let fan_out_limit = match env::var("FAN_OUT_LIMIT") {
            Ok(v) => v.parse().context("parsing FAN_OUT_LIMIT")?,
            Err(_) => 8usize.min(symbols.len().max(1)),
        };

        let config = Self {
            symbols,
            tick_interval_seconds: env::var("TICK_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()?,
            min_confidence_threshold: env::var("MIN_CONFIDENCE_THRESHOLD")
                .unwrap_or_else(|_| "75.0".to_string())
                .parse()?,
            max_staleness_seconds: env::var("MAX_STALENESS_SECONDS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()?,
            price_change_threshold_pct: env::var("PRICE_CHANGE_THRESHOLD_PCT")
                .unwrap_or_else(|_| "0.1".to_string())
                .parse()?,
            soft_budget_signal_generation_ms: env::var("SOFT_BUDGET_SIGNAL_GENERATION_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
            soft_budget_data_source_fetch_ms: env::var("SOFT_BUDGET_DATA_SOURCE_FETCH_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            fetch_deadline_ms: env::var("FETCH_DEADLINE_MS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()?,
            agreement_floor: env::var("AGREEMENT_FLOOR")
                .unwrap_or_else(|_| "0.15".to_string())
                .parse()?,
            agreement_bonus: env::var("AGREEMENT_BONUS")
                .unwrap_or_else(|_| "0.10".to_string())
                .parse()?,
            retention_seconds: env::var("RETENTION_SECONDS")
                .unwrap_or_else(|_| "220752000".to_string()) // ~7 years
                .parse()?,
            run_24_7: env::var("PIPELINE_24_7")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
            stop_loss_pct: match env::var("STOP_LOSS_PCT") {
                Ok(v) => Some(v.parse().context("parsing STOP_LOSS_PCT")?),
                Err(_) => None,
            },
            take_profit_pct: match env::var("TAKE_PROFIT_PCT") {
                Ok(v) => Some(v.parse().context("parsing TAKE_PROFIT_PCT")?),
                Err(_) => None,
            },

            sources,
            executors,
            queue: QueueConfig {
                default_ttl_seconds: env::var("QUEUE_DEFAULT_TTL_SECONDS")
                    .unwrap_or_else(|_| "3600".to_string())
                    .parse()?,
                max_attempts: env::var("QUEUE_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()?,
                retry_base_ms: env::var("QUEUE_RETRY_BASE_MS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()?,
                retry_cap_ms: env::var("QUEUE_RETRY_CAP_MS")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()?,
            },
            cache: CacheConfig {
                local_max_entries: env::var("CACHE_LOCAL_MAX_ENTRIES")
                    .unwrap_or_else(|_| "10000".to_string())
                    .parse()?,
                shared_enabled: env::var("CACHE_SHARED_ENABLED")
                    .unwrap_or_else(|_| "false".to_string())
                    .parse()?,
                redis_url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                ..CacheConfig::default()
            },
            regime: RegimeConfig {
                short_ma: env::var("REGIME_SHORT_MA")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()?,
                long_ma: env::var("REGIME_LONG_MA")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()?,
                high_vol_threshold_pct: env::var("REGIME_HIGH_VOL_THRESHOLD_PCT")
                    .unwrap_or_else(|_| "3.0".to_string())
                    .parse()?,
                ..RegimeConfig::default()
            },

            fan_out_limit,
            distributor_workers: env::var("DISTRIBUTOR_WORKERS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            executor_inflight_bound: env::var("EXECUTOR_INFLIGHT_BOUND")
                .unwrap_or_else(|_| "1024".to_string())
                .parse()?,
            account_poll_interval_seconds: env::var("ACCOUNT_POLL_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,
            queue_max_sleep_seconds: env::var("QUEUE_MAX_SLEEP_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            stop_grace_seconds: env::var("STOP_GRACE_SECONDS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            maintenance_interval_seconds: env::var("MAINTENANCE_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "300".to_string())
                .parse()?,

            validate_timeout_ms: env::var("VALIDATE_TIMEOUT_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()?,
            submit_timeout_ms: env::var("SUBMIT_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,
            snapshot_timeout_ms: env::var("SNAPSHOT_TIMEOUT_MS")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()?,

            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:signals.db".to_string()),
            health_bind_addr: env::var("HEALTH_BIND_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:8090".to_string()),
            alert_webhook_url: env::var("ALERT_WEBHOOK_URL").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with. Invalid config is
    /// fatal at startup, never patched up silently.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("SYMBOLS must name at least one symbol");
        }
        if self.sources.is_empty() {
            bail!("SOURCES_CONFIG must configure at least one data source");
        }
        if !(0.0..=100.0).contains(&self.min_confidence_threshold) {
            bail!(
                "MIN_CONFIDENCE_THRESHOLD {} outside [0,100]",
                self.min_confidence_threshold
            );
        }
        if self.tick_interval_seconds == 0 {
            bail!("TICK_INTERVAL_SECONDS must be positive");
        }
        if self.queue.max_attempts < 1 {
            bail!("QUEUE_MAX_ATTEMPTS must be at least 1");
        }
        if self.agreement_floor < 0.0 || self.agreement_floor >= 1.0 {
            bail!("AGREEMENT_FLOOR {} outside [0,1)", self.agreement_floor);
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.weight <= 0.0 {
                bail!("source {} has non-positive weight", source.id);
            }
            if !seen.insert(&source.id) {
                bail!("duplicate source id {}", source.id);
            }
        }
        let mut seen = HashSet::new();
        for executor in &self.executors {
            if !seen.insert(&executor.id) {
                bail!("duplicate executor id {}", executor.id);
            }
            if !(0.0..=100.0).contains(&executor.min_confidence) {
                bail!(
                    "executor {} min_confidence {} outside [0,100]",
                    executor.id,
                    executor.min_confidence
                );
            }
        }
        if self.regime.short_ma == 0 || self.regime.long_ma <= self.regime.short_ma {
            bail!(
                "regime MAs must satisfy 0 < short ({}) < long ({})",
                self.regime.short_ma,
                self.regime.long_ma
            );
        }
        Ok(())
    }

    /// Normalized base weights across configured sources (sum to 1).
    pub fn normalized_source_weights(&self) -> Vec<(String, f64)> {
        let total: f64 = self.sources.iter().map(|s| s.weight).sum();
        self.sources
            .iter()
            .map(|s| (s.id.clone(), s.weight / total))
            .collect()
    }
}
