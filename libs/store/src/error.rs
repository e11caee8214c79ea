use thiserror::Error;

/// Errors surfaced by store operations
///
/// Connection-class failures (retryable at startup, auto-recovered by the
/// connection manager at runtime) are distinguishable from logical replies
/// via [`StoreError::is_connection_error`].
#[derive(Error, Debug)]
pub enum StoreError {
    /// Driver-level error (connection or command)
    #[error("Store error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Connection could not be established after retries
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Health ping failed or returned an unexpected reply
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),
}

impl StoreError {
    /// Check if this is a connection-class error that might be recoverable.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Redis(e) => {
                if self.is_pop_timeout() {
                    return false;
                }
                let err_str = e.to_string().to_lowercase();
                err_str.contains("connection")
                    || err_str.contains("disconnected")
                    || err_str.contains("broken pipe")
                    || err_str.contains("reset by peer")
                    || err_str.contains("refused")
                    || err_str.contains("eof")
                    || err_str.contains("io error")
            }
            Self::ConnectionFailed(_) => true,
            Self::HealthCheckFailed(_) => false,
        }
    }

    /// Check if this is a blocking-pop timeout (normal behavior, not an error).
    ///
    /// A `BRPOP` that returns nothing within its bounded timeout is expected;
    /// consumers loop and re-arm.
    pub fn is_pop_timeout(&self) -> bool {
        match self {
            Self::Redis(e) => {
                let err_str = e.to_string().to_lowercase();
                err_str.contains("timed out") && !err_str.contains("connection")
            }
            _ => false,
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_failed_is_connection_error() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.is_connection_error());
        assert!(!err.is_pop_timeout());
    }

    #[test]
    fn test_health_check_is_not_connection_error() {
        let err = StoreError::HealthCheckFailed("unexpected reply".to_string());
        assert!(!err.is_connection_error());
    }
}
