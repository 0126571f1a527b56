//! Tests for committing closed windows

use crate::support::{FlakyClearStore, FlakyDurableStore, HOUR, at, closed_port};
use anyhow::Result;
use pretty_assertions::assert_eq;
use common::{Px, Symbol};
use price_sampler::committer::CommitOutcome;
use price_sampler::{
    DurableStore, MemoryMetricStore, MemoryTransientStore, Observation, PipelineError,
    RedisMetricStore, RollupCommitter, RunningAggregate, TransientRecord, TransientStore, Window,
};
use std::sync::Arc;
use std::time::Duration;

/// Aggregate of the first window with its records already buffered
async fn buffered_window(buffer: &dyn TransientStore) -> Result<RunningAggregate> {
    let mut agg = RunningAggregate::empty(Symbol::new("BTCUSDT"), Window::containing(at(0), HOUR));
    for (units, secs) in [(100, 0), (105, 1), (95, 2), (102, 3)] {
        let obs = Observation::new(Symbol::new("BTCUSDT"), Px::from_units(units), at(secs));
        buffer.append(TransientRecord::from(&obs)).await?;
        agg.apply(&obs)?;
    }
    // first record of the next window must survive every clear
    buffer
        .append(TransientRecord {
            symbol: Symbol::new("BTCUSDT"),
            price: Px::from_units(103),
            observed_at: at(3600),
        })
        .await?;
    Ok(agg)
}

#[tokio::test]
async fn test_commit_writes_then_clears_window() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(MemoryMetricStore::new());
    let committer = RollupCommitter::new(durable.clone(), buffer.clone(), Duration::from_secs(1));
    let agg = buffered_window(buffer.as_ref()).await?;

    let outcome = committer.commit(&agg).await?;

    let CommitOutcome::Committed { metric, cleared } = outcome else {
        panic!("expected a clean commit, got {outcome:?}");
    };
    assert_eq!(cleared, 4);
    assert_eq!(metric.avg, "100.5".parse::<Px>()?);
    assert_eq!(durable.get(&metric.symbol, metric.window_start).await?, Some(metric));
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_failed_write_preserves_buffer() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(FlakyDurableStore::failing(1));
    let committer = RollupCommitter::new(durable.clone(), buffer.clone(), Duration::from_secs(1));
    let agg = buffered_window(buffer.as_ref()).await?;

    let err = committer.commit(&agg).await.unwrap_err();
    assert!(matches!(err, PipelineError::DurableWriteFailed { .. }));
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 5);
    assert_eq!(durable.count().await?, 0);

    // the same aggregate commits cleanly on retry
    let outcome = committer.commit(&agg).await?;
    assert!(matches!(outcome, CommitOutcome::Committed { cleared: 4, .. }));
    assert_eq!(durable.count().await?, 1);
    assert_eq!(durable.attempts(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_write_times_out() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(FlakyDurableStore::hanging(1, Duration::from_secs(60)));
    let committer = RollupCommitter::new(durable.clone(), buffer.clone(), Duration::from_secs(2));
    let agg = buffered_window(buffer.as_ref()).await?;

    let err = committer.commit(&agg).await.unwrap_err();

    assert_eq!(err.kind(), "durable_write_failed");
    assert!(err.to_string().contains("timed out"));
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 5);
    Ok(())
}

#[tokio::test]
async fn test_recommit_is_idempotent() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(MemoryMetricStore::new());
    let committer = RollupCommitter::new(durable.clone(), buffer.clone(), Duration::from_secs(1));
    let agg = buffered_window(buffer.as_ref()).await?;

    let first = committer.commit(&agg).await?;
    let second = committer.commit(&agg).await?;

    assert_eq!(first.metric(), second.metric());
    assert_eq!(durable.count().await?, 1);
    assert_eq!(durable.writes(), 2);
    assert!(matches!(second, CommitOutcome::Committed { cleared: 0, .. }));
    Ok(())
}

#[tokio::test]
async fn test_empty_aggregate_is_not_written() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(MemoryMetricStore::new());
    let committer = RollupCommitter::new(durable.clone(), buffer, Duration::from_secs(1));
    let agg = RunningAggregate::empty(Symbol::new("BTCUSDT"), Window::containing(at(0), HOUR));

    let err = committer.commit(&agg).await.unwrap_err();

    assert!(matches!(err, PipelineError::EmptyWindow { .. }));
    assert_eq!(durable.writes(), 0);
    Ok(())
}

#[tokio::test]
async fn test_clear_failure_keeps_commit() -> Result<()> {
    let buffer = Arc::new(FlakyClearStore::failing(1));
    let durable = Arc::new(MemoryMetricStore::new());
    let committer = RollupCommitter::new(durable.clone(), buffer.clone(), Duration::from_secs(1));
    let agg = buffered_window(buffer.as_ref()).await?;

    let outcome = committer.commit(&agg).await?;

    assert!(matches!(outcome, CommitOutcome::ClearFailed { .. }));
    assert_eq!(durable.count().await?, 1);
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 5);

    assert_eq!(committer.clear(&Symbol::new("BTCUSDT"), at(3600)).await?, 4);
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_redis_fails_the_write_not_the_start() -> Result<()> {
    let durable = Arc::new(RedisMetricStore::new(&format!(
        "redis://127.0.0.1:{}/",
        closed_port()?
    ))?);
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let committer = RollupCommitter::new(durable, buffer.clone(), Duration::from_secs(2));
    let agg = buffered_window(buffer.as_ref()).await?;

    let err = committer.commit(&agg).await.unwrap_err();
    assert!(matches!(err, PipelineError::DurableWriteFailed { .. }));
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 5);
    Ok(())
}
