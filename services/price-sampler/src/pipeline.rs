//! Per-symbol sampling and rollup
//!
//! Every symbol owns a [`SymbolState`] behind its own async mutex. A sample and a rollup for the
//! same symbol never interleave, while different symbols proceed independently.

use crate::aggregator::RunningAggregate;
use crate::committer::{CommitOutcome, RollupCommitter};
use crate::error::{PipelineError, PipelineResult};
use crate::fetcher::ObservationFetcher;
use crate::metrics::PipelineMetrics;
use crate::storage::TransientStore;
use crate::{Observation, TransientRecord, Window};
use common::{Symbol, Ts};
use futures::future::join_all;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

/// Aggregation state of one symbol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolState {
    /// Aggregate of the window currently accepting observations
    pub open: RunningAggregate,
    /// Closed windows awaiting commit, oldest first
    pub sealed: VecDeque<RunningAggregate>,
    /// Upper bound of a buffer clear that failed after its window was committed
    pub pending_clear: Option<Ts>,
    /// Buffered observations stamped after the open window, oldest first
    pub deferred: VecDeque<Observation>,
}

impl SymbolState {
    /// Fresh state with an empty aggregate for `window`
    #[must_use]
    pub fn new(symbol: Symbol, window: Window) -> Self {
        Self {
            open: RunningAggregate::empty(symbol, window),
            sealed: VecDeque::new(),
            pending_clear: None,
            deferred: VecDeque::new(),
        }
    }

    /// Close the open window if `now` is past its end
    ///
    /// A non-empty aggregate is queued for commit, then deferred observations that are no longer
    /// ahead of the new open window are folded. Returns true when an empty window was closed.
    pub fn advance(&mut self, now: Ts) -> bool {
        if !self.open.window.is_closed(now) {
            return false;
        }

        let next = Window::containing(now, self.open.window.duration());
        let fresh = self.open.reset(next);
        let closed = std::mem::replace(&mut self.open, fresh);
        let empty = closed.is_empty();
        if !empty {
            debug!(
                "Sealed {} window {} with {} samples",
                closed.symbol, closed.window.start, closed.count
            );
            self.sealed.push_back(closed);
        }

        self.release_deferred();
        empty
    }

    /// Fold deferred observations whose window is the open one or already closed
    fn release_deferred(&mut self) {
        let len = self.open.window.duration();
        while let Some(front) = self.deferred.front() {
            let window = Window::containing(front.observed_at, len);
            if window.start > self.open.window.start {
                break;
            }
            let Some(obs) = self.deferred.pop_front() else {
                break;
            };

            let target = if window == self.open.window {
                &mut self.open
            } else {
                if self.sealed.back().is_none_or(|a| a.window != window) {
                    self.sealed
                        .push_back(RunningAggregate::empty(obs.symbol.clone(), window));
                }
                match self.sealed.back_mut() {
                    Some(aggregate) => aggregate,
                    None => break,
                }
            };
            if let Err(e) = target.apply(&obs) {
                warn!("Dropped deferred observation: {}", e);
            }
        }
    }

    fn note_cleared(&mut self, before: Ts) {
        if self.pending_clear.is_some_and(|pending| pending <= before) {
            self.pending_clear = None;
        }
    }

    fn note_clear_failed(&mut self, before: Ts) {
        self.pending_clear = Some(self.pending_clear.map_or(before, |p| p.max(before)));
    }
}

/// Outcome counts of one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Samples folded
    pub successes: usize,
    /// Samples dropped or commits failed
    pub failures: usize,
    /// Windows written to durable storage
    pub committed: usize,
    /// Closed windows that had no samples
    pub skipped_empty: usize,
    /// Sealed windows and buffer clears still waiting after this tick
    pub backlog: usize,
    /// Errors behind `failures`
    pub errors: Vec<PipelineError>,
}

impl TickReport {
    fn merge(&mut self, other: Self) {
        self.successes += other.successes;
        self.failures += other.failures;
        self.committed += other.committed;
        self.skipped_empty += other.skipped_empty;
        self.backlog += other.backlog;
        self.errors.extend(other.errors);
    }

    fn failed(error: PipelineError) -> Self {
        Self {
            failures: 1,
            errors: vec![error],
            ..Self::default()
        }
    }
}

/// Sampling pipeline over a fixed symbol set
pub struct Pipeline {
    symbols: Vec<Symbol>,
    window: Duration,
    fetcher: ObservationFetcher,
    buffer: Arc<dyn TransientStore>,
    committer: RollupCommitter,
    metrics: PipelineMetrics,
    states: FxHashMap<Symbol, Arc<Mutex<SymbolState>>>,
}

impl Pipeline {
    /// Create a pipeline whose first windows contain `now`
    #[must_use]
    pub fn new(
        symbols: &[Symbol],
        window: Duration,
        fetcher: ObservationFetcher,
        buffer: Arc<dyn TransientStore>,
        committer: RollupCommitter,
        metrics: PipelineMetrics,
        now: Ts,
    ) -> Self {
        let mut unique: Vec<Symbol> = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            if !unique.contains(symbol) {
                unique.push(symbol.clone());
            }
        }

        let current = Window::containing(now, window);
        let states = unique
            .iter()
            .map(|s| {
                (
                    s.clone(),
                    Arc::new(Mutex::new(SymbolState::new(s.clone(), current))),
                )
            })
            .collect();

        Self {
            symbols: unique,
            window,
            fetcher,
            buffer,
            committer,
            metrics,
            states,
        }
    }

    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    #[must_use]
    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn buffer(&self) -> &Arc<dyn TransientStore> {
        &self.buffer
    }

    pub(crate) fn state(&self, symbol: &Symbol) -> PipelineResult<&Arc<Mutex<SymbolState>>> {
        self.states
            .get(symbol)
            .ok_or_else(|| PipelineError::UnknownSymbol(symbol.clone()))
    }

    /// Copy of the open aggregate of `symbol`
    pub async fn snapshot(&self, symbol: &Symbol) -> PipelineResult<RunningAggregate> {
        Ok(self.state(symbol)?.lock().await.open.clone())
    }

    /// Sealed windows of `symbol` still waiting for commit
    pub async fn sealed_windows(&self, symbol: &Symbol) -> PipelineResult<Vec<Window>> {
        Ok(self
            .state(symbol)?
            .lock()
            .await
            .sealed
            .iter()
            .map(|a| a.window)
            .collect())
    }

    /// Fetch and fold one observation for every symbol
    ///
    /// Symbols are processed concurrently; a failure for one symbol never affects another.
    pub async fn sample_tick(&self) -> TickReport {
        let outcomes = join_all(self.symbols.iter().map(|symbol| async move {
            let result = self.sample_symbol(symbol).await;
            (symbol, result)
        }))
        .await;

        let mut report = TickReport::default();
        for (symbol, result) in outcomes {
            match result {
                Ok(()) => {
                    self.metrics.record_fetch_success(symbol);
                    report.successes += 1;
                }
                Err(e) => {
                    warn!("Skipped sample for {}: {}", symbol, e);
                    self.metrics.record_fetch_failure(symbol, e.kind());
                    report.merge(TickReport::failed(e));
                }
            }
        }
        report
    }

    async fn sample_symbol(&self, symbol: &Symbol) -> PipelineResult<()> {
        let obs = self.fetcher.fetch(symbol).await?;
        self.ingest(obs).await
    }

    /// Buffer and fold one observation
    ///
    /// The observation is validated against the open window before it is buffered, so a
    /// rejected observation never reaches the buffer.
    pub async fn ingest(&self, obs: Observation) -> PipelineResult<()> {
        let mut state = self.state(&obs.symbol)?.lock().await;

        if state.advance(obs.observed_at) {
            self.metrics.record_rollup_empty(&obs.symbol);
        }
        state.open.check(&obs)?;
        self.buffer.append(TransientRecord::from(&obs)).await?;
        state.open.apply(&obs)?;

        trace!("Folded {} @ {} ({} samples)", obs.symbol, obs.price, state.open.count);
        Ok(())
    }

    /// Close expired windows and commit every sealed window, oldest first
    pub async fn rollup_tick(&self, now: Ts) -> TickReport {
        let reports = join_all(self.symbols.iter().map(|symbol| self.rollup_symbol(symbol, now))).await;

        let mut report = TickReport::default();
        for r in reports {
            report.merge(r);
        }
        report
    }

    async fn rollup_symbol(&self, symbol: &Symbol, now: Ts) -> TickReport {
        let mut report = TickReport::default();
        let state_lock = match self.state(symbol) {
            Ok(s) => s,
            Err(e) => return TickReport::failed(e),
        };
        let mut state = state_lock.lock().await;

        if let Some(before) = state.pending_clear {
            match self.committer.clear(symbol, before).await {
                Ok(cleared) => {
                    debug!("Retried clear of {} before {}: {} records", symbol, before, cleared);
                    state.pending_clear = None;
                }
                Err(e) => {
                    warn!("Retried clear of {} before {} failed: {:#}", symbol, before, e);
                    self.metrics.record_buffer_clear_failure(symbol);
                }
            }
        }

        if state.advance(now) {
            self.metrics.record_rollup_empty(symbol);
            report.skipped_empty += 1;
        }

        while let Some(aggregate) = state.sealed.front() {
            match self.committer.commit(aggregate).await {
                Ok(CommitOutcome::Committed { metric, .. }) => {
                    self.metrics.record_rollup_success(symbol);
                    state.note_cleared(metric.window_end);
                    report.committed += 1;
                }
                Ok(CommitOutcome::ClearFailed { metric, .. }) => {
                    self.metrics.record_rollup_success(symbol);
                    self.metrics.record_buffer_clear_failure(symbol);
                    state.note_clear_failed(metric.window_end);
                    report.committed += 1;
                }
                Err(PipelineError::EmptyWindow { .. }) => {
                    self.metrics.record_rollup_empty(symbol);
                    report.skipped_empty += 1;
                }
                Err(e) => {
                    error!("Rollup of {} failed, will retry: {}", symbol, e);
                    self.metrics.record_rollup_failure(symbol, e.kind());
                    report.merge(TickReport::failed(e));
                    break;
                }
            }
            state.sealed.pop_front();
        }

        report.backlog = state.sealed.len() + usize::from(state.pending_clear.is_some());
        report
    }

    /// Persist buffered records
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.buffer.flush().await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("symbols", &self.symbols)
            .field("window", &self.window)
            .field("fetcher", &self.fetcher)
            .field("committer", &self.committer)
            .finish_non_exhaustive()
    }
}
