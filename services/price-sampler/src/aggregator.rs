//! Running OHLC/avg aggregation for one symbol and one window
//!
//! `fold`, `snapshot` and `reset` are pure, the pipeline owns the state and decides when to
//! call them.

use crate::error::{PipelineError, PipelineResult};
use crate::{HourlyMetric, Observation, Window};
use common::{Px, Symbol, Ts};
use serde::{Deserialize, Serialize};

/// Per-symbol aggregate for the currently open window
///
/// OHLC fields are meaningless while `count == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningAggregate {
    /// Symbol
    pub symbol: Symbol,
    /// Window being aggregated
    pub window: Window,
    /// First price
    pub open: Px,
    /// Highest price
    pub high: Px,
    /// Lowest price
    pub low: Px,
    /// Last price
    pub close: Px,
    /// Number of observations folded
    pub count: u64,
    /// Sum of all prices in ticks
    pub sum: i128,
    /// Timestamp of the last observation folded
    pub last_observed_at: Option<Ts>,
}

impl RunningAggregate {
    /// Empty aggregate for `window`
    #[must_use]
    pub const fn empty(symbol: Symbol, window: Window) -> Self {
        Self {
            symbol,
            window,
            open: Px::ZERO,
            high: Px::ZERO,
            low: Px::ZERO,
            close: Px::ZERO,
            count: 0,
            sum: 0,
            last_observed_at: None,
        }
    }

    /// True until the first observation is folded
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Check that `obs` may be folded without mutating anything
    pub fn check(&self, obs: &Observation) -> PipelineResult<()> {
        if obs.symbol != self.symbol {
            return Err(PipelineError::SymbolMismatch {
                expected: self.symbol.clone(),
                actual: obs.symbol.clone(),
            });
        }
        if !self.window.contains(obs.observed_at) {
            return Err(PipelineError::OutsideWindow {
                symbol: obs.symbol.clone(),
                observed_at: obs.observed_at,
                window_start: self.window.start,
                window_end: self.window.end,
            });
        }
        if let Some(last) = self.last_observed_at {
            if obs.observed_at < last {
                return Err(PipelineError::OutOfOrder {
                    symbol: obs.symbol.clone(),
                    observed_at: obs.observed_at,
                    last_observed_at: last,
                });
            }
        }
        Ok(())
    }

    /// Fold one observation, returning the updated aggregate
    ///
    /// Observations must arrive in non-decreasing `observed_at` order and fall inside the window.
    pub fn fold(&self, obs: &Observation) -> PipelineResult<Self> {
        let mut next = self.clone();
        next.apply(obs)?;
        Ok(next)
    }

    /// In-place variant of [`RunningAggregate::fold`]
    pub fn apply(&mut self, obs: &Observation) -> PipelineResult<()> {
        self.check(obs)?;

        let price = obs.price;
        if self.count == 0 {
            self.open = price;
            self.high = price;
            self.low = price;
        } else {
            if price > self.high {
                self.high = price;
            }
            if price < self.low {
                self.low = price;
            }
        }

        self.close = price;
        self.count += 1;
        self.sum += i128::from(price.as_i64());
        self.last_observed_at = Some(obs.observed_at);
        Ok(())
    }

    /// Average price in ticks, rounded half away from zero
    #[must_use]
    pub fn average(&self) -> Option<Px> {
        if self.count == 0 {
            return None;
        }
        let count = i128::from(self.count);
        let half = count / 2;
        let rounded = if self.sum >= 0 {
            (self.sum + half) / count
        } else {
            (self.sum - half) / count
        };
        // the mean of i64 prices always fits in i64
        Some(Px::from_i64(i64::try_from(rounded).unwrap_or(i64::MAX)))
    }

    /// Project the durable metric for this window
    pub fn snapshot(&self) -> PipelineResult<HourlyMetric> {
        let (Some(avg), Some(last_observed_at)) = (self.average(), self.last_observed_at) else {
            return Err(PipelineError::EmptyWindow {
                symbol: self.symbol.clone(),
                window_start: self.window.start,
            });
        };

        Ok(HourlyMetric {
            symbol: self.symbol.clone(),
            window_start: self.window.start,
            window_end: self.window.end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            avg,
            sample_count: self.count,
            last_observed_at,
        })
    }

    /// Empty aggregate for another window of the same symbol
    #[must_use]
    pub fn reset(&self, window: Window) -> Self {
        Self::empty(self.symbol.clone(), window)
    }
}
