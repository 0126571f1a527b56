//! Storage backends: transient observation buffer and durable metric store

pub mod events;
pub mod memory;
pub mod redis_store;
pub mod segment;
pub mod wal;
pub mod wal_buffer;

use crate::error::PipelineResult;
use crate::{HourlyMetric, TransientRecord};
use anyhow::Result;
use async_trait::async_trait;
use common::{Symbol, Ts};

pub use events::BufferEntry;
pub use memory::{MemoryMetricStore, MemoryTransientStore};
pub use redis_store::RedisMetricStore;
pub use segment::{Segment, SegmentReader};
pub use wal::{Wal, WalEntry, WalStats};
pub use wal_buffer::WalTransientStore;

/// Default bound on buffered records per symbol, two days at 5 s sampling
pub const DEFAULT_MAX_RECORDS_PER_SYMBOL: usize = 34_560;

/// Append-only buffer of raw observations
///
/// Records for a symbol are kept in arrival order. `clear` only ever removes records strictly
/// older than the given bound.
#[async_trait]
pub trait TransientStore: Send + Sync {
    /// Buffer one record
    ///
    /// Fails with `BufferFull` when the symbol is at capacity and `BufferWriteFailed` when the
    /// backend cannot persist the record. Either way nothing is buffered.
    async fn append(&self, record: TransientRecord) -> PipelineResult<()>;

    /// Remove every record of `symbol` with `observed_at < before`, returning how many were removed
    async fn clear(&self, symbol: &Symbol, before: Ts) -> Result<usize>;

    /// Point-in-time snapshot of the records of `symbol`
    async fn all(&self, symbol: &Symbol) -> Result<TransientIter>;

    /// Number of buffered records for `symbol`
    async fn len(&self, symbol: &Symbol) -> Result<usize>;

    /// Symbols with at least one buffered record
    async fn symbols(&self) -> Result<Vec<Symbol>>;

    /// Persist anything still held in memory
    async fn flush(&self) -> Result<()>;
}

/// Durable store of committed window metrics
///
/// Rows are keyed by `(symbol, window_start)`. `upsert` of an identical row is a no-op.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Write or overwrite the row for the metric's key
    async fn upsert(&self, metric: &HourlyMetric) -> Result<()>;

    /// Fetch the row for `(symbol, window_start)`
    async fn get(&self, symbol: &Symbol, window_start: Ts) -> Result<Option<HourlyMetric>>;

    /// Total number of rows
    async fn count(&self) -> Result<usize>;
}

/// Iterator over a snapshot of buffered records
///
/// Later appends and clears are not observed. Call [`TransientStore::all`] again to restart.
#[derive(Debug, Clone, Default)]
pub struct TransientIter {
    records: std::vec::IntoIter<TransientRecord>,
}

impl TransientIter {
    /// Wrap an owned snapshot
    #[must_use]
    pub fn new(records: Vec<TransientRecord>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

impl Iterator for TransientIter {
    type Item = TransientRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.records.size_hint()
    }
}

impl ExactSizeIterator for TransientIter {}
