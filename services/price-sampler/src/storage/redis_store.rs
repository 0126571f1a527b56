//! Redis durable store
//!
//! Each row is a JSON string at `metric:{symbol}:{window_start_secs}`, indexed by window start in
//! the sorted set `metrics:{symbol}` and listed in the set `metrics:all`. The three writes go out
//! in one `MULTI` pipeline.

use super::DurableStore;
use crate::HourlyMetric;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::{Symbol, Ts};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const ALL_METRICS_KEY: &str = "metrics:all";

/// Key of the row for `(symbol, window_start)`
#[must_use]
pub fn metric_key(symbol: &Symbol, window_start: Ts) -> String {
    format!("metric:{}:{}", symbol, window_start.as_secs())
}

/// Sorted-set index of a symbol's rows
#[must_use]
pub fn index_key(symbol: &Symbol) -> String {
    format!("metrics:{symbol}")
}

/// [`DurableStore`] backed by Redis
///
/// The connection is opened on first use. Until one succeeds, every call tries to connect and
/// fails like any other write.
#[derive(Clone)]
pub struct RedisMetricStore {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
}

impl RedisMetricStore {
    /// Store for `url`. Only the URL is checked here
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = self
                    .client
                    .get_connection_manager()
                    .await
                    .context("Failed to connect to Redis")?;
                info!("Connected durable store to {:?}", self.client.get_connection_info().addr);
                Ok::<_, anyhow::Error>(manager)
            })
            .await?;
        Ok(manager.clone())
    }
}

#[async_trait]
impl DurableStore for RedisMetricStore {
    async fn upsert(&self, metric: &HourlyMetric) -> Result<()> {
        let key = metric_key(&metric.symbol, metric.window_start);
        let value = serde_json::to_string(metric)?;
        let mut conn = self.connection().await?;

        let (): () = redis::pipe()
            .atomic()
            .set(&key, value)
            .ignore()
            .zadd(index_key(&metric.symbol), &key, metric.window_start.as_secs())
            .ignore()
            .sadd(ALL_METRICS_KEY, &key)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!("Upserted {}", key);
        Ok(())
    }

    async fn get(&self, symbol: &Symbol, window_start: Ts) -> Result<Option<HourlyMetric>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(metric_key(symbol, window_start)).await?;
        value
            .map(|v| serde_json::from_str(&v))
            .transpose()
            .map_err(Into::into)
    }

    async fn count(&self) -> Result<usize> {
        let mut conn = self.connection().await?;
        let count: usize = conn.scard(ALL_METRICS_KEY).await?;
        Ok(count)
    }
}

impl std::fmt::Debug for RedisMetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisMetricStore").finish_non_exhaustive()
    }
}
