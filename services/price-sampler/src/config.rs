//! Price sampler configuration
//!
//! Layered as defaults, then an optional JSON file, then `SAMPLER_*` environment variables. The
//! daemon applies its command-line flags last.

use crate::fetcher::binance::DEFAULT_TICKER_URL;
use crate::scheduler::SchedulerConfig;
use crate::storage::DEFAULT_MAX_RECORDS_PER_SYMBOL;
use crate::storage::wal::DEFAULT_SEGMENT_SIZE;
use anyhow::{Context, Result, bail};
use common::Symbol;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Price sampler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Symbols to sample
    pub symbols: Vec<String>,

    /// Seconds between sample ticks
    pub sample_interval_secs: u64,

    /// Aggregation window length in seconds
    pub window_secs: u64,

    /// Seconds before retrying a failed commit
    pub rollup_retry_secs: u64,

    /// Seconds between counter summaries in the log, 0 disables them
    pub metrics_log_interval_secs: u64,

    /// Price provider
    pub provider: ProviderConfig,

    /// Transient buffer
    pub buffer: BufferConfig,

    /// Durable metric store
    pub durable: DurableConfig,
}

/// Price provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Ticker endpoint
    pub url: String,

    /// Hard deadline of one fetch in milliseconds
    pub fetch_timeout_ms: u64,
}

/// Transient buffer backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferBackend {
    /// Process memory, lost on restart
    Memory,
    /// Write-ahead log on local disk
    Wal,
}

/// Transient buffer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Backend
    pub backend: BufferBackend,

    /// WAL directory
    pub wal_dir: PathBuf,

    /// WAL segment size in bytes
    pub segment_size_bytes: u64,

    /// Upper bound on buffered records per symbol
    pub max_records_per_symbol: usize,
}

/// Durable store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurableBackend {
    /// Process memory, for dry runs
    Memory,
    /// Redis server
    Redis,
}

/// Durable store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableConfig {
    /// Backend
    pub backend: DurableBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Deadline of one durable write in milliseconds
    pub write_timeout_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "BTCUSDT".to_string(),
                "ETHUSDT".to_string(),
                "LTCBTC".to_string(),
            ],
            sample_interval_secs: 5,
            window_secs: 3600,
            rollup_retry_secs: 30,
            metrics_log_interval_secs: 300,
            provider: ProviderConfig::default(),
            buffer: BufferConfig::default(),
            durable: DurableConfig::default(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_TICKER_URL.to_string(),
            fetch_timeout_ms: 3000,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            backend: BufferBackend::Wal,
            wal_dir: PathBuf::from("./data/sampler-wal"),
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            max_records_per_symbol: DEFAULT_MAX_RECORDS_PER_SYMBOL,
        }
    }
}

impl Default for DurableConfig {
    fn default() -> Self {
        Self {
            backend: DurableBackend::Redis,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            write_timeout_ms: 5000,
        }
    }
}

impl SamplerConfig {
    /// Defaults, overlaid with `path` if given, overlaid with the process environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a JSON file, missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `SAMPLER_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbols) = lookup("SAMPLER_SYMBOLS") {
            self.symbols = symbols
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("SAMPLER_SAMPLE_INTERVAL_SECS") {
            self.sample_interval_secs = v
                .parse()
                .with_context(|| format!("SAMPLER_SAMPLE_INTERVAL_SECS={v}"))?;
        }
        if let Some(v) = lookup("SAMPLER_WINDOW_SECS") {
            self.window_secs = v
                .parse()
                .with_context(|| format!("SAMPLER_WINDOW_SECS={v}"))?;
        }
        if let Some(url) = lookup("SAMPLER_REDIS_URL") {
            self.durable.redis_url = url;
        }
        if let Some(dir) = lookup("SAMPLER_WAL_DIR") {
            self.buffer.wal_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("SAMPLER_PROVIDER_URL") {
            self.provider.url = url;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.symbols.iter().all(|s| s.trim().is_empty()) {
            bail!("At least one symbol is required");
        }
        if self.sample_interval_secs == 0 {
            bail!("sample_interval_secs must be positive");
        }
        if self.window_secs == 0 {
            bail!("window_secs must be positive");
        }
        if self.sample_interval_secs >= self.window_secs {
            bail!(
                "sample_interval_secs ({}) must be shorter than window_secs ({})",
                self.sample_interval_secs,
                self.window_secs
            );
        }
        if self.rollup_retry_secs == 0 {
            bail!("rollup_retry_secs must be positive");
        }
        if self.provider.fetch_timeout_ms == 0 {
            bail!("provider.fetch_timeout_ms must be positive");
        }
        if self.durable.write_timeout_ms == 0 {
            bail!("durable.write_timeout_ms must be positive");
        }
        if self.buffer.max_records_per_symbol == 0 {
            bail!("buffer.max_records_per_symbol must be positive");
        }
        Ok(())
    }

    /// Configured symbols, normalised and without blanks
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols
            .iter()
            .filter(|s| !s.trim().is_empty())
            .map(Symbol::new)
            .collect()
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.provider.fetch_timeout_ms)
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.durable.write_timeout_ms)
    }

    #[must_use]
    pub const fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            sample_interval: Duration::from_secs(self.sample_interval_secs),
            rollup_retry_interval: Duration::from_secs(self.rollup_retry_secs),
        }
    }
}
