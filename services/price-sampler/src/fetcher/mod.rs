//! Observation fetcher
//!
//! Wraps an external price source behind [`PriceProvider`] and enforces a hard deadline on every
//! call so a stuck provider can never stall a sample tick.

pub mod binance;

use crate::Observation;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use common::{Px, Symbol, Ts};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

pub use binance::BinanceTickerProvider;

/// Price as returned by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Last traded price
    pub price: Px,
    /// Time the price was observed
    pub observed_at: Ts,
}

/// External market-data source
#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// Fetch the current price for `symbol`
    async fn fetch(&self, symbol: &Symbol) -> PipelineResult<Quote>;

    /// Provider name for logs
    fn name(&self) -> &str;
}

/// Deadline-bounded fetcher producing [`Observation`]s
#[derive(Clone)]
pub struct ObservationFetcher {
    provider: Arc<dyn PriceProvider>,
    timeout: Duration,
}

impl ObservationFetcher {
    /// Create new fetcher
    #[must_use]
    pub fn new(provider: Arc<dyn PriceProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    /// Configured deadline
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Fetch one observation, an elapsed deadline is reported as `ProviderUnavailable`
    pub async fn fetch(&self, symbol: &Symbol) -> PipelineResult<Observation> {
        let quote = tokio::time::timeout(self.timeout, self.provider.fetch(symbol))
            .await
            .map_err(|_| PipelineError::ProviderUnavailable {
                symbol: symbol.clone(),
                reason: format!(
                    "{} did not answer within {:?}",
                    self.provider.name(),
                    self.timeout
                ),
            })??;

        trace!("Fetched {} @ {} from {}", symbol, quote.price, self.provider.name());
        Ok(Observation::new(symbol.clone(), quote.price, quote.observed_at))
    }
}

impl std::fmt::Debug for ObservationFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationFetcher")
            .field("provider", &self.provider.name())
            .field("timeout", &self.timeout)
            .finish()
    }
}
