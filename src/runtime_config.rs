// =============================================================================
// Pipeline Configuration — JSON settings file with env overrides
// =============================================================================
//
// Every tunable of the candle pipeline lives here. All fields carry
// `#[serde(default = ...)]` so a partial or older file still loads.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.
//
// Secrets (the provider API key) never live in this file; they come from the
// environment only.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::history::ResolverSettings;
use crate::lifecycle::LifecycleSettings;
use crate::market_data::PriceBounds;
use crate::market_hours::MarketSchedule;

pub const DEFAULT_CONFIG_PATH: &str = "pipeline_config.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "OANDA:XAU_USD".to_string(),
        "OANDA:EUR_USD".to_string(),
        "OANDA:GBP_USD".to_string(),
        "BINANCE:BTCUSDT".to_string(),
    ]
}

fn default_min_price() -> f64 {
    0.01
}

fn default_max_price() -> f64 {
    1_000_000.0
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 3600
}

fn default_retention_days() -> u32 {
    30
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_provider_timeout_secs() -> u64 {
    10
}

fn default_store_timeout_secs() -> u64 {
    5
}

fn default_tick_channel_capacity() -> usize {
    10_000
}

fn default_count_back() -> usize {
    300
}

fn default_friday_close_hour() -> u32 {
    22
}

fn default_sunday_open_hour() -> u32 {
    22
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_db_path() -> Option<String> {
    Some("candles.db".to_string())
}

fn default_pool_size() -> u32 {
    4
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_provider_url() -> String {
    crate::provider::finnhub::DEFAULT_BASE_URL.to_string()
}

// =============================================================================
// PipelineConfig
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Instruments subscribed on the tick feed.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Ticks priced outside `[min_price, max_price]` are dropped.
    #[serde(default = "default_min_price")]
    pub min_price: f64,

    #[serde(default = "default_max_price")]
    pub max_price: f64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Candles older than this many days are deleted by the retention task.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    /// Ticks queued between the feed reader and the aggregator before new
    /// ticks are dropped.
    #[serde(default = "default_tick_channel_capacity")]
    pub tick_channel_capacity: usize,

    #[serde(default = "default_count_back")]
    pub default_count_back: usize,

    /// Weekly close, Friday, hour UTC.
    #[serde(default = "default_friday_close_hour")]
    pub friday_close_hour: u32,

    /// Weekly open, Sunday, hour UTC.
    #[serde(default = "default_sunday_open_hour")]
    pub sunday_open_hour: u32,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// SQLite database file. `null` (or an empty `PIPELINE_DB_PATH`) means
    /// an in-memory store.
    #[serde(default = "default_db_path")]
    pub db_path: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    #[serde(default = "default_provider_url")]
    pub provider_url: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            retention_days: default_retention_days(),
            cache_ttl_secs: default_cache_ttl_secs(),
            provider_timeout_secs: default_provider_timeout_secs(),
            store_timeout_secs: default_store_timeout_secs(),
            tick_channel_capacity: default_tick_channel_capacity(),
            default_count_back: default_count_back(),
            friday_close_hour: default_friday_close_hour(),
            sunday_open_hour: default_sunday_open_hour(),
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            pool_size: default_pool_size(),
            feed_url: default_feed_url(),
            provider_url: default_provider_url(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pipeline config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse pipeline config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "pipeline config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` with an atomic write (`.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise pipeline config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "pipeline config saved (atomic)");
        Ok(())
    }

    /// Apply `PIPELINE_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(syms) = lookup("PIPELINE_SYMBOLS") {
            let symbols: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !symbols.is_empty() {
                self.symbols = symbols;
            }
        }
        if let Some(addr) = lookup("PIPELINE_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(path) = lookup("PIPELINE_DB_PATH") {
            self.db_path = Some(path).filter(|p| !p.trim().is_empty());
        }
        if let Some(url) = lookup("PIPELINE_FEED_URL") {
            self.feed_url = url;
        }
        if let Some(url) = lookup("PIPELINE_PROVIDER_URL") {
            self.provider_url = url;
        }
    }

    pub fn price_bounds(&self) -> PriceBounds {
        PriceBounds {
            min: self.min_price,
            max: self.max_price,
        }
    }

    pub fn schedule(&self) -> MarketSchedule {
        MarketSchedule::new(self.friday_close_hour, self.sunday_open_hour)
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            cache_ttl: Duration::from_secs(self.cache_ttl_secs),
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            default_count_back: self.default_count_back.max(1),
        }
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs.max(1)),
            retention_days: self.retention_days,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.max(1))
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs.max(1))
    }

    /// Feed URL with the API token appended as a query parameter.
    pub fn feed_url_with_token(&self, token: &str) -> String {
        if token.is_empty() {
            self.feed_url.clone()
        } else {
            format!("{}?token={}", self.feed_url, token)
        }
    }
}
