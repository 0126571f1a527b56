//! Binance public ticker provider
//!
//! `GET /api/v3/ticker/price?symbol=BTCUSDT` answers `{"symbol":"BTCUSDT","price":"50000.00000000"}`.
//! The endpoint carries no timestamp, the receipt time is used instead.

use super::{PriceProvider, Quote};
use crate::error::{PipelineError, PipelineResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{Px, Symbol, Ts};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Default public REST endpoint
pub const DEFAULT_TICKER_URL: &str = "https://api.binance.com/api/v3/ticker/price";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

/// REST client for the Binance ticker price endpoint
#[derive(Debug, Clone)]
pub struct BinanceTickerProvider {
    client: Client,
    base_url: String,
}

impl BinanceTickerProvider {
    /// Create new provider with a per-request timeout
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("price-sampler/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    /// Endpoint queried by this provider
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn unavailable(symbol: &Symbol, reason: impl Into<String>) -> PipelineError {
        PipelineError::ProviderUnavailable {
            symbol: symbol.clone(),
            reason: reason.into(),
        }
    }

    fn malformed(symbol: &Symbol, reason: impl Into<String>) -> PipelineError {
        PipelineError::ProviderError {
            symbol: symbol.clone(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl PriceProvider for BinanceTickerProvider {
    async fn fetch(&self, symbol: &Symbol) -> PipelineResult<Quote> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .map_err(|e| Self::unavailable(symbol, e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Self::unavailable(symbol, e.to_string()))?;
        let observed_at = Ts::now();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Self::unavailable(symbol, format!("HTTP {status}")));
        }
        if !status.is_success() {
            let reason = serde_json::from_str::<ApiError>(&body).map_or_else(
                |_| format!("HTTP {status}"),
                |api| format!("HTTP {status}: {} (code {})", api.msg, api.code),
            );
            return Err(Self::malformed(symbol, reason));
        }

        let ticker: TickerPrice = serde_json::from_str(&body)
            .map_err(|e| Self::malformed(symbol, format!("invalid ticker json: {e}")))?;
        if Symbol::new(&ticker.symbol) != *symbol {
            return Err(Self::malformed(
                symbol,
                format!("response for {} instead", ticker.symbol),
            ));
        }

        let price: Px = ticker
            .price
            .parse()
            .map_err(|e| Self::malformed(symbol, format!("{e}")))?;
        if !price.is_positive() {
            return Err(Self::malformed(symbol, format!("non-positive price {price}")));
        }

        debug!("{}: {} at {}", symbol, price, observed_at);
        Ok(Quote { price, observed_at })
    }

    fn name(&self) -> &str {
        "binance"
    }
}
