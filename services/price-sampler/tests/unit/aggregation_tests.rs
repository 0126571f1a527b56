//! Tests for running aggregation and window arithmetic

use crate::support::{HOUR, T0, at};
use anyhow::Result;
use common::{Px, Symbol, Ts};
use price_sampler::{Observation, PipelineError, RunningAggregate, Window};
use rstest::*;
use std::time::Duration;

#[fixture]
fn aggregate() -> RunningAggregate {
    RunningAggregate::empty(Symbol::new("BTCUSD"), Window::containing(at(0), HOUR))
}

fn fold_all(mut agg: RunningAggregate, prices: &[&str]) -> Result<RunningAggregate> {
    for (i, price) in prices.iter().enumerate() {
        let obs = Observation::new(Symbol::new("BTCUSD"), price.parse()?, at(i as u64));
        agg = agg.fold(&obs)?;
    }
    Ok(agg)
}

#[rstest]
#[case::hourly_scenario(&["100", "105", "95", "102"], "100", "105", "95", "102", "100.5")]
#[case::single_sample(&["42.5"], "42.5", "42.5", "42.5", "42.5", "42.5")]
#[case::monotonic_rise(&["1", "2", "3", "4"], "1", "4", "1", "4", "2.5")]
#[case::flat(&["7", "7", "7"], "7", "7", "7", "7", "7")]
#[case::sub_tick_mean(&["0.00000001", "0.00000002"], "0.00000001", "0.00000002", "0.00000001", "0.00000002", "0.00000002")]
#[case::crypto_cross(&["0.001234", "0.001236", "0.001230"], "0.001234", "0.001236", "0.00123", "0.00123", "0.00123333")]
fn test_snapshot_projection(
    aggregate: RunningAggregate,
    #[case] prices: &[&str],
    #[case] open: &str,
    #[case] high: &str,
    #[case] low: &str,
    #[case] close: &str,
    #[case] avg: &str,
) -> Result<()> {
    let metric = fold_all(aggregate, prices)?.snapshot()?;

    assert_eq!(metric.open, open.parse::<Px>()?);
    assert_eq!(metric.high, high.parse::<Px>()?);
    assert_eq!(metric.low, low.parse::<Px>()?);
    assert_eq!(metric.close, close.parse::<Px>()?);
    assert_eq!(metric.avg, avg.parse::<Px>()?);
    assert_eq!(metric.sample_count, prices.len() as u64);
    Ok(())
}

#[rstest]
fn test_snapshot_carries_window_bounds(aggregate: RunningAggregate) -> Result<()> {
    let metric = fold_all(aggregate, &["1"])?.snapshot()?;

    assert_eq!(metric.window_start, Ts::from_secs(T0));
    assert_eq!(metric.window_end, Ts::from_secs(T0 + 3600));
    assert_eq!(metric.key(), (Symbol::new("BTCUSD"), Ts::from_secs(T0)));
    Ok(())
}

#[rstest]
fn test_rejected_fold_leaves_aggregate_untouched(aggregate: RunningAggregate) -> Result<()> {
    let agg = fold_all(aggregate, &["100", "101"])?;
    let late = Observation::new(Symbol::new("BTCUSD"), Px::from_units(1), at(0));

    let mut copy = agg.clone();
    let err = copy.apply(&late).unwrap_err();

    assert!(matches!(err, PipelineError::OutOfOrder { .. }));
    assert_eq!(copy, agg);
    Ok(())
}

#[rstest]
fn test_empty_window_snapshot(aggregate: RunningAggregate) {
    let err = aggregate.snapshot().unwrap_err();
    assert_eq!(err.kind(), "empty_window");
    assert!(!err.is_transient());
}

#[rstest]
#[case(Duration::from_secs(60), 1_704_112_496, 1_704_112_440)]
#[case(Duration::from_secs(300), 1_704_112_496, 1_704_112_200)]
#[case(Duration::from_secs(3600), 1_704_112_496, 1_704_110_400)]
#[case(Duration::from_secs(86_400), 1_704_112_496, 1_704_067_200)]
fn test_window_alignment(#[case] len: Duration, #[case] ts: u64, #[case] start: u64) {
    let window = Window::containing(Ts::from_secs(ts), len);

    assert_eq!(window.start, Ts::from_secs(start));
    assert_eq!(window.duration(), len);
    assert!(window.contains(Ts::from_secs(ts)));
}
