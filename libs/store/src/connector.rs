use redis::Client;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::client::StoreClient;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::retry::{RetryConfig, retry_on_connection};

/// Connect to the store and return a [`StoreClient`].
///
/// The underlying `ConnectionManager` automatically handles connection
/// failures and reconnections; the connection is verified with a PING
/// before being handed out.
///
/// # Example
/// ```ignore
/// use store::{StoreConfig, connect};
///
/// let client = connect(StoreConfig::new("redis://127.0.0.1:6379")).await?;
/// ```
pub async fn connect(config: StoreConfig) -> StoreResult<StoreClient> {
    info!("Attempting to connect to store at {}", config.url);

    let client = Client::open(config.url.as_str()).map_err(StoreError::Redis)?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .map_err(StoreError::Redis)?;

    let store = StoreClient::new(client, manager, config);
    let latency = store.ping().await?;

    info!(latency_ms = latency.as_millis() as u64, "Connected to store");
    Ok(store)
}

/// Connect using a config loaded elsewhere (alias kept for call-site clarity).
pub async fn connect_from_config(config: StoreConfig) -> StoreResult<StoreClient> {
    connect(config).await
}

/// Connect with retry on connection-class failures.
///
/// Startup helper for workers racing the store itself coming up; logical
/// failures (an imposter answering PING, a bad URL) still fail fast.
pub async fn connect_with_retry(
    config: StoreConfig,
    retry_config: Option<RetryConfig>,
) -> StoreResult<StoreClient> {
    retry_on_connection(
        || connect(config.clone()),
        retry_config.unwrap_or_default(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires a running store
    async fn test_connect() {
        let url =
            std::env::var("STORE_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let result = connect(StoreConfig::new(url)).await;
        assert!(result.is_ok());
    }
}
