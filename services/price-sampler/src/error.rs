//! Error taxonomy for the sampling pipeline

use common::{Symbol, Ts};
use thiserror::Error;

/// Pipeline error types
///
/// None of these are process-fatal. Provider and durable-store failures are retried on the next
/// tick; the remaining variants describe a rejected observation or an unusable aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Provider unreachable, timed out or throttling
    #[error("provider unavailable for {symbol}: {reason}")]
    ProviderUnavailable {
        /// Symbol being fetched
        symbol: Symbol,
        /// Underlying cause
        reason: String,
    },

    /// Provider answered with a malformed or unexpected response
    #[error("provider error for {symbol}: {reason}")]
    ProviderError {
        /// Symbol being fetched
        symbol: Symbol,
        /// Underlying cause
        reason: String,
    },

    /// Window closed without a single observation
    #[error("no observations for {symbol} in window starting {window_start}")]
    EmptyWindow {
        /// Symbol of the empty aggregate
        symbol: Symbol,
        /// Start of the empty window
        window_start: Ts,
    },

    /// Durable store unreachable, timed out or rejected the write
    #[error("durable write failed for {symbol} window {window_start}: {reason}")]
    DurableWriteFailed {
        /// Symbol being committed
        symbol: Symbol,
        /// Window being committed
        window_start: Ts,
        /// Underlying cause
        reason: String,
    },

    /// Observation is older than the last one folded for the symbol
    #[error("out-of-order observation for {symbol}: {observed_at} is before {last_observed_at}")]
    OutOfOrder {
        /// Symbol of the observation
        symbol: Symbol,
        /// Timestamp of the rejected observation
        observed_at: Ts,
        /// Latest timestamp already folded
        last_observed_at: Ts,
    },

    /// Observation does not belong to the aggregate's window
    #[error("observation for {symbol} at {observed_at} outside window [{window_start}, {window_end})")]
    OutsideWindow {
        /// Symbol of the observation
        symbol: Symbol,
        /// Timestamp of the rejected observation
        observed_at: Ts,
        /// Window start
        window_start: Ts,
        /// Window end (exclusive)
        window_end: Ts,
    },

    /// Observation was routed to another symbol's aggregate
    #[error("observation for {actual} folded into aggregate for {expected}")]
    SymbolMismatch {
        /// Aggregate symbol
        expected: Symbol,
        /// Observation symbol
        actual: Symbol,
    },

    /// Symbol was never registered with the pipeline
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    /// Transient buffer is at capacity for the symbol
    #[error("transient buffer full for {symbol} ({capacity} records)")]
    BufferFull {
        /// Symbol whose buffer is full
        symbol: Symbol,
        /// Configured capacity
        capacity: usize,
    },

    /// Transient buffer failed to persist or clear records
    #[error("transient buffer failure for {symbol}: {reason}")]
    BufferWriteFailed {
        /// Symbol being written
        symbol: Symbol,
        /// Underlying cause
        reason: String,
    },
}

impl PipelineError {
    /// Stable label used for metrics and structured logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::EmptyWindow { .. } => "empty_window",
            Self::DurableWriteFailed { .. } => "durable_write_failed",
            Self::OutOfOrder { .. } => "out_of_order",
            Self::OutsideWindow { .. } => "outside_window",
            Self::SymbolMismatch { .. } => "symbol_mismatch",
            Self::UnknownSymbol(_) => "unknown_symbol",
            Self::BufferFull { .. } => "buffer_full",
            Self::BufferWriteFailed { .. } => "buffer_write_failed",
        }
    }

    /// True for failures that are expected to clear up on a later tick
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ProviderUnavailable { .. }
                | Self::DurableWriteFailed { .. }
                | Self::BufferFull { .. }
                | Self::BufferWriteFailed { .. }
        )
    }
}

/// Result alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
