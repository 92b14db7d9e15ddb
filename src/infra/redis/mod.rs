//! Redis adapters: cache backend, distributed lock and stream-backed broker.

mod broker;
mod cache;

pub use broker::RedisBroker;
pub use cache::RedisCacheBackend;

use std::time::Duration;

use deadpool_redis::Pool;
use tracing::info;

use super::error::InfraError;

/// Builds a connection pool and checks that the server answers.
pub async fn connect(url: &str, pool_size: usize, timeout: Duration) -> Result<Pool, InfraError> {
    let mut config = deadpool_redis::Config::from_url(url);
    let pool_config = config
        .pool
        .get_or_insert_with(deadpool_redis::PoolConfig::default);
    pool_config.max_size = pool_size;
    pool_config.timeouts.wait = Some(timeout);
    pool_config.timeouts.create = Some(timeout);
    pool_config.timeouts.recycle = Some(timeout);

    let pool = config
        .create_pool(Some(deadpool_redis::Runtime::Tokio1))
        .map_err(|err| InfraError::redis(format!("failed to create pool for {url}: {err}")))?;

    let mut conn = pool
        .get()
        .await
        .map_err(|err| InfraError::redis(format!("failed to connect to {url}: {err}")))?;
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .map_err(|err| InfraError::redis(format!("ping to {url} failed: {err}")))?;

    info!(url, pool_size, "Connected to Redis");
    Ok(pool)
}
