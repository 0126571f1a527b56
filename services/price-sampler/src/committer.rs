//! Commits closed windows to durable storage and releases their buffered records
//!
//! The durable write always happens before the buffer is cleared. If the process dies in between,
//! recovery replays the window and the upsert overwrites the identical row.

use crate::HourlyMetric;
use crate::aggregator::RunningAggregate;
use crate::error::{PipelineError, PipelineResult};
use crate::storage::{DurableStore, TransientStore};
use common::{Symbol, Ts};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a successful durable write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Row written and buffer cleared
    Committed {
        /// Persisted row
        metric: HourlyMetric,
        /// Buffered records removed
        cleared: usize,
    },
    /// Row written but the buffer still holds the window's records
    ClearFailed {
        /// Persisted row
        metric: HourlyMetric,
        /// Why the clear failed
        reason: String,
    },
}

impl CommitOutcome {
    /// The row that was written
    #[must_use]
    pub const fn metric(&self) -> &HourlyMetric {
        match self {
            Self::Committed { metric, .. } | Self::ClearFailed { metric, .. } => metric,
        }
    }
}

/// Writes window metrics and clears the transient buffer behind them
#[derive(Clone)]
pub struct RollupCommitter {
    durable: Arc<dyn DurableStore>,
    buffer: Arc<dyn TransientStore>,
    write_timeout: Duration,
}

impl RollupCommitter {
    #[must_use]
    pub fn new(
        durable: Arc<dyn DurableStore>,
        buffer: Arc<dyn TransientStore>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            durable,
            buffer,
            write_timeout,
        }
    }

    /// Commit one closed window
    ///
    /// Fails with `EmptyWindow` when nothing was folded and `DurableWriteFailed` when the write
    /// errors or exceeds the write timeout. On failure nothing is cleared.
    pub async fn commit(&self, aggregate: &RunningAggregate) -> PipelineResult<CommitOutcome> {
        let metric = aggregate.snapshot()?;

        let write_failed = |reason: String| PipelineError::DurableWriteFailed {
            symbol: metric.symbol.clone(),
            window_start: metric.window_start,
            reason,
        };

        tokio::time::timeout(self.write_timeout, self.durable.upsert(&metric))
            .await
            .map_err(|_| write_failed(format!("write timed out after {:?}", self.write_timeout)))?
            .map_err(|e| write_failed(format!("{e:#}")))?;

        info!(
            "Committed {} [{} .. {}) o={} h={} l={} c={} avg={} n={}",
            metric.symbol,
            metric.window_start,
            metric.window_end,
            metric.open,
            metric.high,
            metric.low,
            metric.close,
            metric.avg,
            metric.sample_count
        );

        match self.buffer.clear(&metric.symbol, metric.window_end).await {
            Ok(cleared) => {
                debug!("Released {} buffered records of {}", cleared, metric.symbol);
                Ok(CommitOutcome::Committed { metric, cleared })
            }
            Err(e) => {
                warn!(
                    "Buffer clear for {} before {} failed after commit: {:#}",
                    metric.symbol, metric.window_end, e
                );
                Ok(CommitOutcome::ClearFailed {
                    metric,
                    reason: format!("{e:#}"),
                })
            }
        }
    }

    /// Retry a buffer clear left over from an earlier commit
    pub async fn clear(&self, symbol: &Symbol, before: Ts) -> anyhow::Result<usize> {
        self.buffer.clear(symbol, before).await
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Duration {
        self.write_timeout
    }
}

impl std::fmt::Debug for RollupCommitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupCommitter")
            .field("write_timeout", &self.write_timeout)
            .finish_non_exhaustive()
    }
}
