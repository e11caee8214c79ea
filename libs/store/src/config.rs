use core_config::{ConfigError, FromEnv, env_parsed, env_required};

/// Store connection configuration
///
/// Covers the connection policy knobs: pool bound for short operations,
/// socket timeouts, blocking-pop timeout, and the health ping interval.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Store connection URL (e.g., "redis://127.0.0.1:6379")
    pub url: String,

    /// Upper bound on multiplexed/short-op connections
    pub max_connections: usize,

    /// Socket timeout for short operations, in milliseconds
    pub socket_timeout_ms: u64,

    /// Bounded timeout for blocking pops, in milliseconds
    ///
    /// Kept short so shutdown wakes blocked consumers quickly.
    pub blocking_timeout_ms: u64,

    /// Interval between health pings, in seconds
    pub health_check_interval_secs: u64,
}

impl StoreConfig {
    /// Create a new StoreConfig with just a URL and default policy
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Set the maximum number of short-op connections
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the socket timeout for short operations
    pub fn with_socket_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.socket_timeout_ms = timeout_ms;
        self
    }

    /// Set the blocking-pop timeout
    pub fn with_blocking_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.blocking_timeout_ms = timeout_ms;
        self
    }

    /// Set the health ping interval
    pub fn with_health_check_interval_secs(mut self, secs: u64) -> Self {
        self.health_check_interval_secs = secs;
        self
    }

    /// Get a reference to the store URL
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 50,
            socket_timeout_ms: 5_000,
            blocking_timeout_ms: 5_000,
            health_check_interval_secs: 30,
        }
    }
}

/// Load StoreConfig from environment variables
///
/// Environment variables:
/// - `STORE_URL` or `REDIS_URL` (required) - store connection string
/// - `STORE_MAX_CONNECTIONS` (optional, default 50)
/// - `STORE_SOCKET_TIMEOUT_MS` (optional, default 5000)
/// - `STORE_BLOCKING_TIMEOUT_MS` (optional, default 5000)
/// - `STORE_HEALTH_CHECK_INTERVAL_SECS` (optional, default 30)
impl FromEnv for StoreConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let url = env_required("STORE_URL")
            .or_else(|_| env_required("REDIS_URL"))
            .map_err(|_| ConfigError::MissingEnvVar("STORE_URL or REDIS_URL".to_string()))?;

        let defaults = StoreConfig::default();

        Ok(Self {
            url,
            max_connections: env_parsed("STORE_MAX_CONNECTIONS", defaults.max_connections)?,
            socket_timeout_ms: env_parsed("STORE_SOCKET_TIMEOUT_MS", defaults.socket_timeout_ms)?,
            blocking_timeout_ms: env_parsed(
                "STORE_BLOCKING_TIMEOUT_MS",
                defaults.blocking_timeout_ms,
            )?,
            health_check_interval_secs: env_parsed(
                "STORE_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            )?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_new() {
        let config = StoreConfig::new("redis://localhost:6379");
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.blocking_timeout_ms, 5_000);
    }

    #[test]
    fn test_store_config_builder() {
        let config = StoreConfig::new("redis://localhost:6379")
            .with_max_connections(10)
            .with_socket_timeout_ms(2_000)
            .with_blocking_timeout_ms(1_000)
            .with_health_check_interval_secs(5);

        assert_eq!(config.max_connections, 10);
        assert_eq!(config.socket_timeout_ms, 2_000);
        assert_eq!(config.blocking_timeout_ms, 1_000);
        assert_eq!(config.health_check_interval_secs, 5);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_store_config_from_env_with_store_url() {
        temp_env::with_var("STORE_URL", Some("redis://localhost:6379"), || {
            let config = StoreConfig::from_env();
            assert!(config.is_ok());
            assert_eq!(config.unwrap().url, "redis://localhost:6379");
        });
    }

    #[test]
    fn test_store_config_from_env_with_redis_url_fallback() {
        temp_env::with_vars(
            [
                ("STORE_URL", None::<&str>),
                ("REDIS_URL", Some("redis://prod:6379")),
            ],
            || {
                let config = StoreConfig::from_env();
                assert!(config.is_ok());
                assert_eq!(config.unwrap().url, "redis://prod:6379");
            },
        );
    }

    #[test]
    fn test_store_config_from_env_missing() {
        temp_env::with_vars(
            [("STORE_URL", None::<&str>), ("REDIS_URL", None::<&str>)],
            || {
                let config = StoreConfig::from_env();
                assert!(config.is_err());
                assert!(config.unwrap_err().to_string().contains("STORE_URL"));
            },
        );
    }

    #[test]
    fn test_store_config_from_env_invalid_number() {
        temp_env::with_vars(
            [
                ("STORE_URL", Some("redis://localhost:6379")),
                ("STORE_MAX_CONNECTIONS", Some("not-a-number")),
            ],
            || {
                let config = StoreConfig::from_env();
                assert!(config.is_err());
                assert!(
                    config
                        .unwrap_err()
                        .to_string()
                        .contains("STORE_MAX_CONNECTIONS")
                );
            },
        );
    }
}
