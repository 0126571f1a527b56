//! Drives the pipeline: one loop samples on a fixed interval, the other commits at window
//! boundaries. Both stop on a broadcast shutdown signal after finishing the tick in flight.

use crate::Window;
use crate::pipeline::{Pipeline, TickReport};
use crate::recovery::{RecoveryReport, recover};
use anyhow::{Context, Result};
use common::Ts;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Timing of the two loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Time between sample ticks
    pub sample_interval: Duration,
    /// Delay before retrying a failed commit
    pub rollup_retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            rollup_retry_interval: Duration::from_secs(30),
        }
    }
}

/// What a loop is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    /// Waiting for the next tick
    Idle,
    /// Fetching and folding observations
    Sampling,
    /// Committing closed windows
    RollingUp,
}

/// Running sample and rollup loops
pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    shutdown_tx: broadcast::Sender<()>,
    sample_state: watch::Receiver<CycleState>,
    rollup_state: watch::Receiver<CycleState>,
    handles: Vec<JoinHandle<()>>,
    recovery: RecoveryReport,
}

impl Scheduler {
    /// Recover buffered state, commit whatever is already closed, then spawn both loops
    pub async fn start(pipeline: Arc<Pipeline>, config: SchedulerConfig) -> Result<Self> {
        let recovery = recover(&pipeline, Ts::now())
            .await
            .context("Failed to recover transient buffer")?;
        if recovery.records > 0 {
            info!(
                "Recovered {} records, {} closed windows to commit",
                recovery.records, recovery.sealed_windows
            );
        }

        let initial = pipeline.rollup_tick(Ts::now()).await;
        log_rollup(&initial);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let (sample_tx, sample_state) = watch::channel(CycleState::Idle);
        let (rollup_tx, rollup_state) = watch::channel(CycleState::Idle);

        let sample_handle = tokio::spawn(sample_loop(
            Arc::clone(&pipeline),
            config.sample_interval,
            sample_tx,
            shutdown_tx.subscribe(),
        ));
        let rollup_handle = tokio::spawn(rollup_loop(
            Arc::clone(&pipeline),
            config.rollup_retry_interval,
            initial.backlog > 0,
            rollup_tx,
            shutdown_tx.subscribe(),
        ));

        info!(
            "Scheduler started for {} symbols: sample every {:?}, window {:?}",
            pipeline.symbols().len(),
            config.sample_interval,
            pipeline.window()
        );

        Ok(Self {
            pipeline,
            shutdown_tx,
            sample_state,
            rollup_state,
            handles: vec![sample_handle, rollup_handle],
            recovery,
        })
    }

    #[must_use]
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    #[must_use]
    pub fn sample_state(&self) -> CycleState {
        *self.sample_state.borrow()
    }

    #[must_use]
    pub fn rollup_state(&self) -> CycleState {
        *self.rollup_state.borrow()
    }

    /// Result of the start-up recovery
    #[must_use]
    pub const fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Signal both loops, wait for their in-flight ticks, then flush the buffer
    pub async fn stop(self) -> Result<()> {
        info!("Stopping scheduler");
        // receivers may already be gone if a loop ended on its own
        let _ = self.shutdown_tx.send(());

        for handle in self.handles {
            handle.await.context("Scheduler loop panicked")?;
        }

        self.pipeline
            .flush()
            .await
            .context("Failed to flush transient buffer")?;
        info!("Scheduler stopped");
        Ok(())
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("sample_state", &self.sample_state())
            .field("rollup_state", &self.rollup_state())
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}

async fn sample_loop(
    pipeline: Arc<Pipeline>,
    period: Duration,
    state: watch::Sender<CycleState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        // shutdown wins over a tick that is already due
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("Sample loop received shutdown signal");
                break;
            }
            _ = interval.tick() => {}
        }

        state.send_replace(CycleState::Sampling);
        let report = pipeline.sample_tick().await;
        state.send_replace(CycleState::Idle);

        debug!(
            "Sample tick: {} folded, {} failed",
            report.successes, report.failures
        );
    }
}

async fn rollup_loop(
    pipeline: Arc<Pipeline>,
    retry_interval: Duration,
    mut backlog: bool,
    state: watch::Sender<CycleState>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let delay = if backlog {
            retry_interval
        } else {
            until_next_boundary(Ts::now(), pipeline.window())
        };

        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("Rollup loop received shutdown signal");
                break;
            }
            () = tokio::time::sleep(delay) => {}
        }

        state.send_replace(CycleState::RollingUp);
        let report = pipeline.rollup_tick(Ts::now()).await;
        state.send_replace(CycleState::Idle);

        log_rollup(&report);
        backlog = report.backlog > 0;
    }
}

/// Time from `now` to the end of the window containing it
fn until_next_boundary(now: Ts, window: Duration) -> Duration {
    Window::containing(now, window)
        .end
        .saturating_duration_since(now)
}

fn log_rollup(report: &TickReport) {
    if report.committed > 0 || report.skipped_empty > 0 {
        info!(
            "Rollup: {} committed, {} empty, {} failed",
            report.committed, report.skipped_empty, report.failures
        );
    }
    if report.backlog > 0 {
        warn!("Rollup backlog of {}, retrying", report.backlog);
    }
}
