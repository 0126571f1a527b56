//! In-memory stores for tests and dry runs

use super::{DurableStore, TransientIter, TransientStore};
use crate::error::{PipelineError, PipelineResult};
use crate::{HourlyMetric, TransientRecord};
use anyhow::Result;
use async_trait::async_trait;
use common::{Symbol, Ts};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

/// Bounded in-memory transient buffer
#[derive(Debug)]
pub struct MemoryTransientStore {
    records: RwLock<FxHashMap<Symbol, VecDeque<TransientRecord>>>,
    max_records_per_symbol: usize,
}

impl MemoryTransientStore {
    /// Create new store holding at most `max_records_per_symbol` records per symbol
    #[must_use]
    pub fn new(max_records_per_symbol: usize) -> Self {
        Self {
            records: RwLock::new(FxHashMap::default()),
            max_records_per_symbol,
        }
    }

    /// Configured per-symbol bound
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_records_per_symbol
    }
}

impl Default for MemoryTransientStore {
    fn default() -> Self {
        Self::new(super::DEFAULT_MAX_RECORDS_PER_SYMBOL)
    }
}

#[async_trait]
impl TransientStore for MemoryTransientStore {
    async fn append(&self, record: TransientRecord) -> PipelineResult<()> {
        let mut records = self.records.write().await;
        let queue = records.entry(record.symbol.clone()).or_default();
        if queue.len() >= self.max_records_per_symbol {
            return Err(PipelineError::BufferFull {
                symbol: record.symbol,
                capacity: self.max_records_per_symbol,
            });
        }
        queue.push_back(record);
        Ok(())
    }

    async fn clear(&self, symbol: &Symbol, before: Ts) -> Result<usize> {
        let mut records = self.records.write().await;
        let Some(queue) = records.get_mut(symbol) else {
            return Ok(0);
        };
        let len = queue.len();
        queue.retain(|r| r.observed_at >= before);
        let removed = len - queue.len();
        if queue.is_empty() {
            records.remove(symbol);
        }
        Ok(removed)
    }

    async fn all(&self, symbol: &Symbol) -> Result<TransientIter> {
        let records = self.records.read().await;
        Ok(TransientIter::new(
            records
                .get(symbol)
                .map(|q| q.iter().cloned().collect())
                .unwrap_or_default(),
        ))
    }

    async fn len(&self, symbol: &Symbol) -> Result<usize> {
        Ok(self.records.read().await.get(symbol).map_or(0, VecDeque::len))
    }

    async fn symbols(&self) -> Result<Vec<Symbol>> {
        let mut symbols: Vec<Symbol> = self.records.read().await.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// In-memory durable store
#[derive(Debug, Default)]
pub struct MemoryMetricStore {
    rows: RwLock<FxHashMap<(Symbol, Ts), HourlyMetric>>,
    writes: AtomicU64,
}

impl MemoryMetricStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows ordered by symbol then window start
    pub async fn rows(&self) -> Vec<HourlyMetric> {
        let mut rows: Vec<HourlyMetric> = self.rows.read().await.values().cloned().collect();
        rows.sort_by(|a, b| a.key().cmp(&b.key()));
        rows
    }

    /// Number of `upsert` calls that reached the store
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DurableStore for MemoryMetricStore {
    async fn upsert(&self, metric: &HourlyMetric) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.rows.write().await.insert(metric.key(), metric.clone());
        Ok(())
    }

    async fn get(&self, symbol: &Symbol, window_start: Ts) -> Result<Option<HourlyMetric>> {
        Ok(self
            .rows
            .read()
            .await
            .get(&(symbol.clone(), window_start))
            .cloned())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.rows.read().await.len())
    }
}
