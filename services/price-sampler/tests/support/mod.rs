//! Test doubles shared by unit and integration tests

#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use common::{Px, Symbol, Ts};
use price_sampler::storage::TransientIter;
use price_sampler::{
    DurableStore, HourlyMetric, MemoryMetricStore, MemoryTransientStore, ObservationFetcher,
    Pipeline, PipelineError, PipelineMetrics, PipelineResult, PriceProvider, Quote,
    RollupCommitter, TransientRecord, TransientStore,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// 2024-01-01T12:00:00Z, start of an hourly window
pub const T0: u64 = 1_704_110_400;
pub const HOUR: Duration = Duration::from_secs(3600);

pub fn at(secs: u64) -> Ts {
    Ts::from_secs(T0 + secs)
}

pub fn quote(units: i64, secs: u64) -> Quote {
    Quote {
        price: Px::from_units(units),
        observed_at: at(secs),
    }
}

/// Provider answering from a per-symbol script, unavailable once a script runs out
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<rustc_hash::FxHashMap<Symbol, VecDeque<PipelineResult<Quote>>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, symbol: &str, response: PipelineResult<Quote>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(Symbol::new(symbol))
            .or_default()
            .push_back(response);
    }

    pub fn push_quote(&self, symbol: &str, units: i64, secs: u64) {
        self.push(symbol, Ok(quote(units, secs)));
    }

    pub fn push_unavailable(&self, symbol: &str) {
        self.push(
            symbol,
            Err(PipelineError::ProviderUnavailable {
                symbol: Symbol::new(symbol),
                reason: "connection refused".to_string(),
            }),
        );
    }
}

#[async_trait]
impl PriceProvider for ScriptedProvider {
    async fn fetch(&self, symbol: &Symbol) -> PipelineResult<Quote> {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(symbol)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Err(PipelineError::ProviderUnavailable {
                    symbol: symbol.clone(),
                    reason: "script exhausted".to_string(),
                })
            })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Provider quoting a fixed price at the current wall-clock time
pub struct LiveClockProvider {
    pub price: Px,
}

#[async_trait]
impl PriceProvider for LiveClockProvider {
    async fn fetch(&self, _symbol: &Symbol) -> PipelineResult<Quote> {
        Ok(Quote {
            price: self.price,
            observed_at: Ts::now(),
        })
    }

    fn name(&self) -> &str {
        "live-clock"
    }
}

/// Provider that takes `delay` to answer and counts its calls
pub struct SlowProvider {
    pub delay: Duration,
    calls: AtomicUsize,
}

impl SlowProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PriceProvider for SlowProvider {
    async fn fetch(&self, _symbol: &Symbol) -> PipelineResult<Quote> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Quote {
            price: Px::from_units(100),
            observed_at: Ts::now(),
        })
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Local port with nothing listening on it
pub fn closed_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

/// Durable store that fails its first `failures` upserts, optionally by hanging
#[derive(Default)]
pub struct FlakyDurableStore {
    pub inner: MemoryMetricStore,
    failures: AtomicUsize,
    hang: Option<Duration>,
    attempts: AtomicUsize,
}

impl FlakyDurableStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn hanging(failures: usize, hang: Duration) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            hang: Some(hang),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DurableStore for FlakyDurableStore {
    async fn upsert(&self, metric: &HourlyMetric) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.take_failure() {
            if let Some(hang) = self.hang {
                tokio::time::sleep(hang).await;
            }
            return Err(anyhow!("durable store unreachable"));
        }
        self.inner.upsert(metric).await
    }

    async fn get(&self, symbol: &Symbol, window_start: Ts) -> Result<Option<HourlyMetric>> {
        self.inner.get(symbol, window_start).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }
}

/// Transient store whose first `failures` clears fail
#[derive(Default)]
pub struct FlakyClearStore {
    pub inner: MemoryTransientStore,
    failures: AtomicUsize,
}

impl FlakyClearStore {
    pub fn failing(failures: usize) -> Self {
        Self {
            inner: MemoryTransientStore::new(1024),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl TransientStore for FlakyClearStore {
    async fn append(&self, record: TransientRecord) -> PipelineResult<()> {
        self.inner.append(record).await
    }

    async fn clear(&self, symbol: &Symbol, before: Ts) -> Result<usize> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(anyhow!("buffer disk full"));
        }
        self.inner.clear(symbol, before).await
    }

    async fn all(&self, symbol: &Symbol) -> Result<TransientIter> {
        self.inner.all(symbol).await
    }

    async fn len(&self, symbol: &Symbol) -> Result<usize> {
        self.inner.len(symbol).await
    }

    async fn symbols(&self) -> Result<Vec<Symbol>> {
        self.inner.symbols().await
    }

    async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }
}

/// Pipeline over `symbols` with hourly windows starting at `T0`
pub fn pipeline(
    symbols: &[&str],
    provider: Arc<dyn PriceProvider>,
    buffer: Arc<dyn TransientStore>,
    durable: Arc<dyn DurableStore>,
) -> Pipeline {
    pipeline_at(symbols, provider, buffer, durable, HOUR, at(0))
}

pub fn pipeline_at(
    symbols: &[&str],
    provider: Arc<dyn PriceProvider>,
    buffer: Arc<dyn TransientStore>,
    durable: Arc<dyn DurableStore>,
    window: Duration,
    now: Ts,
) -> Pipeline {
    let symbols: Vec<Symbol> = symbols.iter().map(Symbol::new).collect();
    let fetcher = ObservationFetcher::new(provider, Duration::from_secs(1));
    let committer = RollupCommitter::new(durable, Arc::clone(&buffer), Duration::from_secs(1));
    let metrics = PipelineMetrics::new().unwrap();
    Pipeline::new(&symbols, window, fetcher, buffer, committer, metrics, now)
}
