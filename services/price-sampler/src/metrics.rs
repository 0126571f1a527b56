//! Prometheus counters for the sampling pipeline
//!
//! Each [`PipelineMetrics`] owns its own registry so pipelines built side by side (tests, dry
//! runs) never collide on metric names.

use common::Symbol;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, Registry, TextEncoder, register_int_counter_vec_with_registry};

/// Totals across all labels, used for periodic log summaries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub fetch_success: u64,
    pub fetch_failure: u64,
    pub rollup_success: u64,
    pub rollup_failure: u64,
    pub rollup_empty: u64,
    pub buffer_clear_failure: u64,
    pub recovered_records: u64,
}

/// Pipeline counters
#[derive(Clone)]
pub struct PipelineMetrics {
    registry: Registry,
    fetch_success: IntCounterVec,
    fetch_failure: IntCounterVec,
    rollup_success: IntCounterVec,
    rollup_failure: IntCounterVec,
    rollup_empty: IntCounterVec,
    buffer_clear_failure: IntCounterVec,
    recovered_records: IntCounterVec,
}

impl PipelineMetrics {
    /// Create counters in a fresh registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let fetch_success = register_int_counter_vec_with_registry!(
            "sampler_fetch_success_total",
            "Observations fetched and folded",
            &["symbol"],
            registry
        )?;
        let fetch_failure = register_int_counter_vec_with_registry!(
            "sampler_fetch_failure_total",
            "Samples dropped by kind",
            &["symbol", "kind"],
            registry
        )?;
        let rollup_success = register_int_counter_vec_with_registry!(
            "sampler_rollup_success_total",
            "Windows committed to durable storage",
            &["symbol"],
            registry
        )?;
        let rollup_failure = register_int_counter_vec_with_registry!(
            "sampler_rollup_failure_total",
            "Window commits that failed and will be retried",
            &["symbol", "kind"],
            registry
        )?;
        let rollup_empty = register_int_counter_vec_with_registry!(
            "sampler_rollup_empty_total",
            "Closed windows without samples",
            &["symbol"],
            registry
        )?;
        let buffer_clear_failure = register_int_counter_vec_with_registry!(
            "sampler_buffer_clear_failure_total",
            "Buffer clears that failed after a successful commit",
            &["symbol"],
            registry
        )?;
        let recovered_records = register_int_counter_vec_with_registry!(
            "sampler_recovered_records_total",
            "Buffered records replayed on start",
            &["symbol"],
            registry
        )?;

        Ok(Self {
            registry,
            fetch_success,
            fetch_failure,
            rollup_success,
            rollup_failure,
            rollup_empty,
            buffer_clear_failure,
            recovered_records,
        })
    }

    pub fn record_fetch_success(&self, symbol: &Symbol) {
        self.fetch_success.with_label_values(&[symbol.as_str()]).inc();
    }

    pub fn record_fetch_failure(&self, symbol: &Symbol, kind: &str) {
        self.fetch_failure
            .with_label_values(&[symbol.as_str(), kind])
            .inc();
    }

    pub fn record_rollup_success(&self, symbol: &Symbol) {
        self.rollup_success.with_label_values(&[symbol.as_str()]).inc();
    }

    pub fn record_rollup_failure(&self, symbol: &Symbol, kind: &str) {
        self.rollup_failure
            .with_label_values(&[symbol.as_str(), kind])
            .inc();
    }

    pub fn record_rollup_empty(&self, symbol: &Symbol) {
        self.rollup_empty.with_label_values(&[symbol.as_str()]).inc();
    }

    pub fn record_buffer_clear_failure(&self, symbol: &Symbol) {
        self.buffer_clear_failure
            .with_label_values(&[symbol.as_str()])
            .inc();
    }

    pub fn record_recovered(&self, symbol: &Symbol, records: u64) {
        self.recovered_records
            .with_label_values(&[symbol.as_str()])
            .inc_by(records);
    }

    #[must_use]
    pub fn fetch_success(&self, symbol: &Symbol) -> u64 {
        self.fetch_success.with_label_values(&[symbol.as_str()]).get()
    }

    #[must_use]
    pub fn fetch_failure(&self, symbol: &Symbol, kind: &str) -> u64 {
        self.fetch_failure
            .with_label_values(&[symbol.as_str(), kind])
            .get()
    }

    #[must_use]
    pub fn rollup_success(&self, symbol: &Symbol) -> u64 {
        self.rollup_success.with_label_values(&[symbol.as_str()]).get()
    }

    #[must_use]
    pub fn rollup_failure(&self, symbol: &Symbol, kind: &str) -> u64 {
        self.rollup_failure
            .with_label_values(&[symbol.as_str(), kind])
            .get()
    }

    #[must_use]
    pub fn rollup_empty(&self, symbol: &Symbol) -> u64 {
        self.rollup_empty.with_label_values(&[symbol.as_str()]).get()
    }

    #[must_use]
    pub fn buffer_clear_failure(&self, symbol: &Symbol) -> u64 {
        self.buffer_clear_failure
            .with_label_values(&[symbol.as_str()])
            .get()
    }

    #[must_use]
    pub fn recovered_records(&self, symbol: &Symbol) -> u64 {
        self.recovered_records
            .with_label_values(&[symbol.as_str()])
            .get()
    }

    /// Sum every counter over all its label values
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            fetch_success: total(&self.fetch_success),
            fetch_failure: total(&self.fetch_failure),
            rollup_success: total(&self.rollup_success),
            rollup_failure: total(&self.rollup_failure),
            rollup_empty: total(&self.rollup_empty),
            buffer_clear_failure: total(&self.buffer_clear_failure),
            recovered_records: total(&self.recovered_records),
        }
    }

    /// Prometheus text exposition of every counter
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn total(counter: &IntCounterVec) -> u64 {
    counter
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

impl std::fmt::Debug for PipelineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineMetrics")
            .field("summary", &self.summary())
            .finish()
    }
}
