//! End-to-end pipeline scenarios with scripted providers and flaky stores

use crate::support::{FlakyClearStore, FlakyDurableStore, ScriptedProvider, at, pipeline};
use anyhow::Result;
use common::{Px, Symbol};
use price_sampler::{
    DurableStore, MemoryMetricStore, MemoryTransientStore, Observation, PipelineError,
    TransientStore,
};
use std::sync::Arc;

#[tokio::test]
async fn test_hourly_metric_from_four_samples() -> Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    for (units, secs) in [(100, 0), (105, 1), (95, 2), (102, 3)] {
        provider.push_quote("BTCUSD", units, secs);
    }
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(MemoryMetricStore::new());
    let p = pipeline(&["BTCUSD"], provider, buffer.clone(), durable.clone());

    for _ in 0..4 {
        assert_eq!(p.sample_tick().await.successes, 1);
    }
    let report = p.rollup_tick(at(3600)).await;

    assert_eq!(report.committed, 1);
    assert_eq!(report.backlog, 0);
    let metric = durable
        .get(&Symbol::new("BTCUSD"), at(0))
        .await?
        .ok_or_else(|| anyhow::anyhow!("metric not written"))?;
    assert_eq!(metric.open, Px::from_units(100));
    assert_eq!(metric.high, Px::from_units(105));
    assert_eq!(metric.low, Px::from_units(95));
    assert_eq!(metric.close, Px::from_units(102));
    assert_eq!(metric.avg, "100.5".parse::<Px>()?);
    assert_eq!(buffer.len(&Symbol::new("BTCUSD")).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_failing_symbol_does_not_affect_others() -> Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_quote("AAAUSD", 10, 0);
    provider.push_quote("BBBUSD", 20, 0);
    provider.push_unavailable("AAAUSD");
    provider.push_quote("BBBUSD", 22, 5);
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let p = pipeline(
        &["AAAUSD", "BBBUSD"],
        provider,
        buffer.clone(),
        Arc::new(MemoryMetricStore::new()),
    );

    p.sample_tick().await;
    let a_before = p.snapshot(&Symbol::new("AAAUSD")).await?;

    let report = p.sample_tick().await;

    assert_eq!(report.successes, 1);
    assert_eq!(report.failures, 1);
    assert!(matches!(
        report.errors.as_slice(),
        [PipelineError::ProviderUnavailable { .. }]
    ));
    assert_eq!(p.snapshot(&Symbol::new("AAAUSD")).await?, a_before);

    let b = p.snapshot(&Symbol::new("BBBUSD")).await?;
    assert_eq!(b.count, 2);
    assert_eq!(b.close, Px::from_units(22));

    assert_eq!(buffer.len(&Symbol::new("AAAUSD")).await?, 1);
    assert_eq!(buffer.len(&Symbol::new("BBBUSD")).await?, 2);

    let metrics = p.metrics();
    assert_eq!(metrics.fetch_failure(&Symbol::new("AAAUSD"), "provider_unavailable"), 1);
    assert_eq!(metrics.fetch_success(&Symbol::new("BBBUSD")), 2);
    Ok(())
}

#[tokio::test]
async fn test_failed_write_retries_then_clears_once() -> Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_quote("BTCUSDT", 100, 10);
    provider.push_quote("BTCUSDT", 110, 20);
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(FlakyDurableStore::failing(1));
    let p = pipeline(&["BTCUSDT"], provider, buffer.clone(), durable.clone());

    p.sample_tick().await;
    p.sample_tick().await;

    let first = p.rollup_tick(at(3600)).await;
    assert_eq!(first.committed, 0);
    assert_eq!(first.failures, 1);
    assert_eq!(first.backlog, 1);
    assert_eq!(durable.count().await?, 0);
    // nothing cleared while the write is outstanding
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 2);
    assert_eq!(p.sealed_windows(&Symbol::new("BTCUSDT")).await?.len(), 1);

    let retry = p.rollup_tick(at(3630)).await;
    assert_eq!(retry.committed, 1);
    assert_eq!(retry.backlog, 0);
    assert_eq!(durable.count().await?, 1);
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 0);

    let metric = durable
        .get(&Symbol::new("BTCUSDT"), at(0))
        .await?
        .ok_or_else(|| anyhow::anyhow!("metric not written"))?;
    assert_eq!(metric.sample_count, 2);
    assert_eq!(metric.avg, Px::from_units(105));

    let metrics = p.metrics();
    assert_eq!(metrics.rollup_failure(&Symbol::new("BTCUSDT"), "durable_write_failed"), 1);
    assert_eq!(metrics.rollup_success(&Symbol::new("BTCUSDT")), 1);
    Ok(())
}

#[tokio::test]
async fn test_samples_keep_flowing_while_commit_is_stuck() -> Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_quote("BTCUSDT", 100, 10);
    provider.push_quote("BTCUSDT", 101, 3610);
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(FlakyDurableStore::failing(2));
    let p = pipeline(&["BTCUSDT"], provider, buffer.clone(), durable.clone());

    p.sample_tick().await;
    assert_eq!(p.rollup_tick(at(3600)).await.failures, 1);

    // next window keeps accumulating with the old one still sealed
    p.sample_tick().await;
    assert_eq!(p.snapshot(&Symbol::new("BTCUSDT")).await?.count, 1);
    assert_eq!(p.rollup_tick(at(3620)).await.failures, 1);

    let report = p.rollup_tick(at(7200)).await;
    assert_eq!(report.committed, 2);
    assert_eq!(durable.count().await?, 2);
    assert_eq!(buffer.len(&Symbol::new("BTCUSDT")).await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_windows_commit_oldest_first() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let durable = Arc::new(FlakyDurableStore::failing(1));
    let p = pipeline(
        &["BTCUSDT"],
        Arc::new(ScriptedProvider::new()),
        buffer.clone(),
        durable.clone(),
    );

    let symbol = Symbol::new("BTCUSDT");
    p.ingest(Observation::new(symbol.clone(), Px::from_units(1), at(10))).await?;
    p.ingest(Observation::new(symbol.clone(), Px::from_units(2), at(3610))).await?;
    assert_eq!(p.sealed_windows(&symbol).await?.len(), 1);

    // the older window fails, the newer one must wait behind it
    let report = p.rollup_tick(at(7200)).await;
    assert_eq!(report.committed, 0);
    assert_eq!(report.backlog, 2);
    assert_eq!(buffer.len(&symbol).await?, 2);

    let report = p.rollup_tick(at(7210)).await;
    assert_eq!(report.committed, 2);
    assert!(durable.get(&symbol, at(0)).await?.is_some());
    assert!(durable.get(&symbol, at(3600)).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_clear_failure_is_retried_next_tick() -> Result<()> {
    let buffer = Arc::new(FlakyClearStore::failing(1));
    let durable = Arc::new(MemoryMetricStore::new());
    let p = pipeline(
        &["BTCUSDT"],
        Arc::new(ScriptedProvider::new()),
        buffer.clone(),
        durable.clone(),
    );
    let symbol = Symbol::new("BTCUSDT");
    p.ingest(Observation::new(symbol.clone(), Px::from_units(1), at(10))).await?;

    let report = p.rollup_tick(at(3600)).await;
    assert_eq!(report.committed, 1);
    assert_eq!(report.backlog, 1);
    assert_eq!(durable.count().await?, 1);
    assert_eq!(buffer.len(&symbol).await?, 1);
    assert!(p.sealed_windows(&symbol).await?.is_empty());

    let report = p.rollup_tick(at(3610)).await;
    assert_eq!(report.committed, 0);
    assert_eq!(report.backlog, 0);
    assert_eq!(buffer.len(&symbol).await?, 0);
    assert_eq!(durable.writes(), 1);
    assert_eq!(p.metrics().buffer_clear_failure(&symbol), 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_window_is_skipped_and_counted() -> Result<()> {
    let durable = Arc::new(MemoryMetricStore::new());
    let p = pipeline(
        &["BTCUSDT"],
        Arc::new(ScriptedProvider::new()),
        Arc::new(MemoryTransientStore::new(64)),
        durable.clone(),
    );

    let report = p.rollup_tick(at(3600)).await;

    assert_eq!(report.committed, 0);
    assert_eq!(report.skipped_empty, 1);
    assert_eq!(report.failures, 0);
    assert_eq!(durable.writes(), 0);
    assert_eq!(p.metrics().rollup_empty(&Symbol::new("BTCUSDT")), 1);
    assert_eq!(p.snapshot(&Symbol::new("BTCUSDT")).await?.window.start, at(3600));
    Ok(())
}

#[tokio::test]
async fn test_full_buffer_drops_sample_without_folding() -> Result<()> {
    let provider = Arc::new(ScriptedProvider::new());
    provider.push_quote("BTCUSDT", 100, 1);
    provider.push_quote("BTCUSDT", 200, 2);
    let p = pipeline(
        &["BTCUSDT"],
        provider,
        Arc::new(MemoryTransientStore::new(1)),
        Arc::new(MemoryMetricStore::new()),
    );

    p.sample_tick().await;
    let report = p.sample_tick().await;

    assert_eq!(report.failures, 1);
    let agg = p.snapshot(&Symbol::new("BTCUSDT")).await?;
    assert_eq!(agg.count, 1);
    assert_eq!(agg.high, Px::from_units(100));
    assert_eq!(p.metrics().fetch_failure(&Symbol::new("BTCUSDT"), "buffer_full"), 1);
    Ok(())
}

#[tokio::test]
async fn test_rejected_observations_never_reach_buffer() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(64));
    let p = pipeline(
        &["BTCUSDT"],
        Arc::new(ScriptedProvider::new()),
        buffer.clone(),
        Arc::new(MemoryMetricStore::new()),
    );
    let symbol = Symbol::new("BTCUSDT");

    p.ingest(Observation::new(symbol.clone(), Px::from_units(1), at(100))).await?;
    let late = p.ingest(Observation::new(symbol.clone(), Px::from_units(2), at(50))).await;
    let unknown = p
        .ingest(Observation::new(Symbol::new("DOGEUSDT"), Px::from_units(2), at(60)))
        .await;

    assert!(matches!(late, Err(PipelineError::OutOfOrder { .. })));
    assert!(matches!(unknown, Err(PipelineError::UnknownSymbol(_))));
    assert_eq!(buffer.len(&symbol).await?, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_ingest_and_rollup_keep_counts() -> Result<()> {
    let buffer = Arc::new(MemoryTransientStore::new(10_000));
    let durable = Arc::new(MemoryMetricStore::new());
    let symbols = ["AAAUSD", "BBBUSD", "CCCUSD", "DDDUSD"];
    let p = Arc::new(pipeline(
        &symbols,
        Arc::new(ScriptedProvider::new()),
        buffer.clone(),
        durable.clone(),
    ));

    let mut tasks = Vec::new();
    for name in symbols {
        let p = Arc::clone(&p);
        tasks.push(tokio::spawn(async move {
            let symbol = Symbol::new(name);
            for i in 0..500u64 {
                p.ingest(Observation::new(symbol.clone(), Px::from_units(1 + (i % 7) as i64), at(i)))
                    .await?;
            }
            anyhow::Ok(())
        }));
    }
    let roller = {
        let p = Arc::clone(&p);
        tokio::spawn(async move {
            for _ in 0..20 {
                p.rollup_tick(at(1000)).await;
                tokio::task::yield_now().await;
            }
        })
    };

    for task in tasks {
        task.await??;
    }
    roller.await?;

    let report = p.rollup_tick(at(3600)).await;
    assert_eq!(report.committed, 4);
    for name in symbols {
        let metric = durable
            .get(&Symbol::new(name), at(0))
            .await?
            .ok_or_else(|| anyhow::anyhow!("missing metric for {name}"))?;
        assert_eq!(metric.sample_count, 500);
        assert_eq!(buffer.len(&Symbol::new(name)).await?, 0);
    }
    Ok(())
}
