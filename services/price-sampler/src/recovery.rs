//! Rebuild aggregation state from the transient buffer on start
//!
//! Whatever is still buffered was never committed, or was committed without its clear. Either way
//! folding it again yields the same metric, and the durable upsert makes a second write harmless.

use crate::Window;
use crate::aggregator::RunningAggregate;
use crate::pipeline::Pipeline;
use crate::{Observation, TransientRecord};
use anyhow::{Context, Result};
use common::{Symbol, Ts};
use std::collections::VecDeque;
use tracing::{info, warn};

/// What recovery found in the buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records folded back into aggregates
    pub records: usize,
    /// Closed windows queued for commit
    pub sealed_windows: usize,
    /// Records stamped after the current window, folded once their window opens
    pub deferred: usize,
    /// Records of symbols no longer configured, removed from the buffer
    pub dropped_unconfigured: usize,
}

/// Fold buffered records of every symbol back into the pipeline
///
/// Must run before the first sample tick. Closed windows are queued for the next rollup, records
/// of the window containing `now` seed the open aggregate. Records of symbols the pipeline does
/// not sample would never be committed, so they are dropped.
pub async fn recover(pipeline: &Pipeline, now: Ts) -> Result<RecoveryReport> {
    let mut report = RecoveryReport {
        dropped_unconfigured: drop_unconfigured(pipeline).await?,
        ..RecoveryReport::default()
    };

    for symbol in pipeline.symbols() {
        let mut records: Vec<TransientRecord> = pipeline.buffer().all(symbol).await?.collect();
        if records.is_empty() {
            continue;
        }
        records.sort_by_key(|r| r.observed_at);

        let (aggregates, deferred) = group_by_window(symbol, records, pipeline.window(), now);
        report.deferred += deferred.len();

        let mut state = pipeline.state(symbol)?.lock().await;
        state.advance(now);
        state.deferred = deferred;

        let mut recovered = 0usize;
        for aggregate in aggregates {
            recovered += aggregate.count as usize;
            if aggregate.window.is_closed(now) {
                report.sealed_windows += 1;
                state.sealed.push_back(aggregate);
            } else {
                state.open = aggregate;
            }
        }

        info!(
            "Recovered {} buffered records of {} ({} windows pending, {} deferred)",
            recovered,
            symbol,
            state.sealed.len(),
            state.deferred.len()
        );
        pipeline.metrics().record_recovered(symbol, recovered as u64);
        report.records += recovered;
    }

    Ok(report)
}

async fn drop_unconfigured(pipeline: &Pipeline) -> Result<usize> {
    let mut dropped = 0;
    for symbol in pipeline.buffer().symbols().await? {
        if pipeline.symbols().contains(&symbol) {
            continue;
        }
        let removed = pipeline
            .buffer()
            .clear(&symbol, Ts::MAX)
            .await
            .with_context(|| format!("Failed to drop buffered records of {symbol}"))?;
        warn!(
            "Dropped {} buffered records of {}, no longer a configured symbol",
            removed, symbol
        );
        dropped += removed;
    }
    Ok(dropped)
}

/// Fold sorted records into one aggregate per window, holding back records after `now`'s window
fn group_by_window(
    symbol: &Symbol,
    records: Vec<TransientRecord>,
    len: std::time::Duration,
    now: Ts,
) -> (Vec<RunningAggregate>, VecDeque<Observation>) {
    let current = Window::containing(now, len);
    let mut aggregates: Vec<RunningAggregate> = Vec::new();
    let mut deferred = VecDeque::new();

    for record in records {
        let obs = Observation::from(record);
        let window = Window::containing(obs.observed_at, len);
        if window.start > current.start {
            warn!(
                "Buffered {} observation at {} is ahead of {}, deferring it",
                symbol, obs.observed_at, now
            );
            deferred.push_back(obs);
            continue;
        }

        if aggregates.last().is_none_or(|a| a.window != window) {
            aggregates.push(RunningAggregate::empty(symbol.clone(), window));
        }
        if let Some(aggregate) = aggregates.last_mut() {
            if let Err(e) = aggregate.apply(&obs) {
                warn!("Dropped unrecoverable buffered record: {}", e);
            }
        }
    }

    (aggregates, deferred)
}
