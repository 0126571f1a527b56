//! Price Sampler Service
//!
//! Samples live prices for a fixed set of symbols and rolls them up into durable windows:
//! - Raw observations land in a transient buffer
//! - Running OHLC/avg aggregates are folded per symbol
//! - Closed windows are committed to durable storage, then the buffer is cleared
//! - Unrolled windows are recovered from the buffer on restart

pub mod aggregator;
pub mod committer;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod pipeline;
pub mod recovery;
pub mod scheduler;
pub mod storage;

use common::{Px, Symbol, Ts};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use aggregator::RunningAggregate;
pub use committer::RollupCommitter;
pub use config::SamplerConfig;
pub use error::{PipelineError, PipelineResult};
pub use fetcher::{BinanceTickerProvider, ObservationFetcher, PriceProvider, Quote};
pub use metrics::PipelineMetrics;
pub use pipeline::{Pipeline, SymbolState, TickReport};
pub use scheduler::{CycleState, Scheduler, SchedulerConfig};
pub use storage::{
    DurableStore, MemoryMetricStore, MemoryTransientStore, RedisMetricStore, TransientStore,
    WalTransientStore,
};

/// Fixed-length aggregation window `[start, end)` aligned to the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Window {
    /// Inclusive start
    pub start: Ts,
    /// Exclusive end
    pub end: Ts,
}

impl Window {
    /// Window of length `len` that contains `ts`
    #[must_use]
    pub fn containing(ts: Ts, len: Duration) -> Self {
        let len_nanos = u64::try_from(len.as_nanos()).unwrap_or(u64::MAX).max(1);
        let start = (ts.as_nanos() / len_nanos) * len_nanos;
        Self {
            start: Ts::from_nanos(start),
            end: Ts::from_nanos(start.saturating_add(len_nanos)),
        }
    }

    /// Window length
    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }

    /// The window immediately following this one
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            start: self.end,
            end: self.end.saturating_add(self.duration()),
        }
    }

    /// True if `ts` falls inside `[start, end)`
    #[must_use]
    pub fn contains(&self, ts: Ts) -> bool {
        self.start <= ts && ts < self.end
    }

    /// True once `now` has reached the window end
    #[must_use]
    pub fn is_closed(&self, now: Ts) -> bool {
        now >= self.end
    }
}

/// Single price observation produced by the fetcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    /// Symbol
    pub symbol: Symbol,
    /// Observed price
    pub price: Px,
    /// Observation time
    pub observed_at: Ts,
}

impl Observation {
    /// Create new observation
    #[must_use]
    pub const fn new(symbol: Symbol, price: Px, observed_at: Ts) -> Self {
        Self {
            symbol,
            price,
            observed_at,
        }
    }
}

/// Raw buffer entry, mirrors [`Observation`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransientRecord {
    /// Symbol
    pub symbol: Symbol,
    /// Observed price
    pub price: Px,
    /// Observation time
    pub observed_at: Ts,
}

impl From<&Observation> for TransientRecord {
    fn from(obs: &Observation) -> Self {
        Self {
            symbol: obs.symbol.clone(),
            price: obs.price,
            observed_at: obs.observed_at,
        }
    }
}

impl From<TransientRecord> for Observation {
    fn from(record: TransientRecord) -> Self {
        Self {
            symbol: record.symbol,
            price: record.price,
            observed_at: record.observed_at,
        }
    }
}

/// Durable rollup of one window for one symbol
///
/// Keyed by `(symbol, window_start)`; written once and never updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyMetric {
    /// Symbol
    pub symbol: Symbol,
    /// Window start (inclusive)
    pub window_start: Ts,
    /// Window end (exclusive)
    pub window_end: Ts,
    /// First price in the window
    pub open: Px,
    /// Highest price
    pub high: Px,
    /// Lowest price
    pub low: Px,
    /// Last price, also the latest price of the window
    pub close: Px,
    /// Arithmetic mean of all prices
    pub avg: Px,
    /// Number of observations folded
    pub sample_count: u64,
    /// Timestamp of the last observation
    pub last_observed_at: Ts,
}

impl HourlyMetric {
    /// Key identifying the row in durable storage
    #[must_use]
    pub fn key(&self) -> (Symbol, Ts) {
        (self.symbol.clone(), self.window_start)
    }
}
