//! Price Sampler daemon
//!
//! Samples configured symbols on a fixed interval, buffers raw observations, and commits one
//! OHLC/avg row per symbol and window to the durable store.

use anyhow::{Context, Result};
use clap::Parser;
use common::Ts;
use price_sampler::config::{BufferBackend, DurableBackend};
use price_sampler::{
    BinanceTickerProvider, DurableStore, MemoryMetricStore, MemoryTransientStore,
    ObservationFetcher, Pipeline, PipelineMetrics, RedisMetricStore, RollupCommitter,
    SamplerConfig, Scheduler, TransientStore, WalTransientStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "price-sampler";
const PROVIDER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = SERVICE_NAME)]
#[command(about = "Sample market prices and roll them up into windowed OHLC metrics")]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "SAMPLER_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated symbols, overrides the configuration
    #[arg(long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,

    /// Seconds between samples
    #[arg(long)]
    sample_interval_secs: Option<u64>,

    /// Window length in seconds
    #[arg(long)]
    window_secs: Option<u64>,

    /// Redis URL of the durable store
    #[arg(long)]
    redis_url: Option<String>,

    /// Directory of the transient buffer WAL
    #[arg(long)]
    wal_dir: Option<PathBuf>,

    /// Ticker endpoint
    #[arg(long)]
    provider_url: Option<String>,

    /// Keep everything in memory instead of WAL and Redis
    #[arg(long)]
    dry_run: bool,
}

impl Cli {
    fn apply(self, config: &mut SamplerConfig) {
        if let Some(symbols) = self.symbols {
            config.symbols = symbols;
        }
        if let Some(secs) = self.sample_interval_secs {
            config.sample_interval_secs = secs;
        }
        if let Some(secs) = self.window_secs {
            config.window_secs = secs;
        }
        if let Some(url) = self.redis_url {
            config.durable.redis_url = url;
        }
        if let Some(dir) = self.wal_dir {
            config.buffer.wal_dir = dir;
        }
        if let Some(url) = self.provider_url {
            config.provider.url = url;
        }
        if self.dry_run {
            config.buffer.backend = BufferBackend::Memory;
            config.durable.backend = DurableBackend::Memory;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info", SERVICE_NAME.replace('-', "_")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SamplerConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!("Starting {} v{}", SERVICE_NAME, env!("CARGO_PKG_VERSION"));
    info!(
        "Symbols {:?}, sample every {}s, window {}s",
        config.symbols, config.sample_interval_secs, config.window_secs
    );

    let pipeline = Arc::new(build_pipeline(&config).await?);
    let scheduler = Scheduler::start(Arc::clone(&pipeline), config.scheduler()).await?;

    if config.metrics_log_interval_secs > 0 {
        spawn_summary_logger(
            Arc::clone(&pipeline),
            Duration::from_secs(config.metrics_log_interval_secs),
        );
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Received shutdown signal");

    scheduler.stop().await?;
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

fn spawn_summary_logger(pipeline: Arc<Pipeline>, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            let s = pipeline.metrics().summary();
            info!(
                "Counters: fetch ok={} failed={}, rollup ok={} failed={} empty={}, clear failed={}, recovered={}",
                s.fetch_success,
                s.fetch_failure,
                s.rollup_success,
                s.rollup_failure,
                s.rollup_empty,
                s.buffer_clear_failure,
                s.recovered_records
            );
        }
    });
}

async fn build_pipeline(config: &SamplerConfig) -> Result<Pipeline> {
    let provider = BinanceTickerProvider::new(&config.provider.url, PROVIDER_REQUEST_TIMEOUT)?;
    let fetcher = ObservationFetcher::new(Arc::new(provider), config.fetch_timeout());

    let buffer: Arc<dyn TransientStore> = match config.buffer.backend {
        BufferBackend::Memory => Arc::new(MemoryTransientStore::new(
            config.buffer.max_records_per_symbol,
        )),
        BufferBackend::Wal => Arc::new(
            WalTransientStore::open(
                &config.buffer.wal_dir,
                Some(config.buffer.segment_size_bytes),
                config.buffer.max_records_per_symbol,
            )
            .with_context(|| {
                format!("Failed to open buffer at {}", config.buffer.wal_dir.display())
            })?,
        ),
    };

    let durable: Arc<dyn DurableStore> = match config.durable.backend {
        DurableBackend::Memory => Arc::new(MemoryMetricStore::new()),
        DurableBackend::Redis => Arc::new(RedisMetricStore::new(&config.durable.redis_url)?),
    };

    let committer = RollupCommitter::new(durable, Arc::clone(&buffer), config.write_timeout());
    let metrics = PipelineMetrics::new().context("Failed to register metrics")?;

    Ok(Pipeline::new(
        &config.symbols(),
        config.window(),
        fetcher,
        buffer,
        committer,
        metrics,
        Ts::now(),
    ))
}
