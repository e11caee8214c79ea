pub mod tracing;

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

/// Errors raised while assembling worker configuration from the
/// environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    /// The value parsed but violates a cross-field constraint (e.g. a hard
    /// deadline shorter than the soft one).
    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

/// Where this worker process is running.
///
/// Development means a laptop next to a throwaway store container;
/// production means a fleet member whose logs land in an aggregator.
/// The distinction only drives log formatting and default verbosity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    /// Read `APP_ENV`; anything other than "production" is development.
    pub fn from_env() -> Self {
        match env::var("APP_ENV") {
            Ok(value) if value.eq_ignore_ascii_case("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Read an environment variable, falling back to a default when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read a required environment variable.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable into `T`, keeping `default` when the
/// variable is unset or empty.
///
/// This is the workhorse behind the store and broker config loaders: every
/// numeric knob goes through it so a typo fails loudly with the offending
/// key instead of silently falling back.
pub fn env_parsed<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) if raw.is_empty() => Ok(default),
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        }),
    }
}

/// Name and version of the calling crate, for health endpoints and logs
#[derive(Clone, Debug)]
pub struct AppInfo {
    pub name: &'static str,
    pub version: &'static str,
}

/// Capture the calling crate's package name and version at compile time
#[macro_export]
macro_rules! app_info {
    () => {
        $crate::AppInfo {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_from_env() {
        temp_env::with_var_unset("APP_ENV", || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
        temp_env::with_var("APP_ENV", Some("production"), || {
            let env = Environment::from_env();
            assert!(env.is_production());
            assert!(!env.is_development());
            assert_eq!(env.as_str(), "production");
        });
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
        // Unrecognized values fall back to development rather than failing
        // worker startup
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("SOME_VAR", Some("set"), || {
            assert_eq!(env_or_default("SOME_VAR", "fallback"), "set");
        });
        temp_env::with_var_unset("SOME_VAR", || {
            assert_eq!(env_or_default("SOME_VAR", "fallback"), "fallback");
        });
    }

    #[test]
    fn test_env_required() {
        temp_env::with_var("NEEDED", Some("value"), || {
            assert_eq!(env_required("NEEDED").unwrap(), "value");
        });
        temp_env::with_var_unset("NEEDED", || {
            let err = env_required("NEEDED").unwrap_err();
            assert!(err.to_string().contains("NEEDED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parsed_defaults_and_values() {
        temp_env::with_var_unset("WORKERS", || {
            assert_eq!(env_parsed("WORKERS", 4usize).unwrap(), 4);
        });
        temp_env::with_var("WORKERS", Some(""), || {
            assert_eq!(env_parsed("WORKERS", 4usize).unwrap(), 4);
        });
        temp_env::with_var("WORKERS", Some("16"), || {
            assert_eq!(env_parsed("WORKERS", 4usize).unwrap(), 16);
        });
    }

    #[test]
    fn test_env_parsed_reports_the_key() {
        temp_env::with_var("WORKERS", Some("lots"), || {
            let err = env_parsed("WORKERS", 4usize).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { .. }));
            assert!(err.to_string().contains("WORKERS"));
        });
    }

    #[test]
    fn test_invalid_error_names_the_key() {
        let err = ConfigError::Invalid {
            key: "HARD_LIMIT_SECS".to_string(),
            reason: "must be >= SOFT_LIMIT_SECS".to_string(),
        };
        assert!(err.to_string().contains("HARD_LIMIT_SECS"));
        assert!(err.to_string().contains(">= SOFT_LIMIT_SECS"));
    }

    #[test]
    fn test_app_info_macro() {
        let info = app_info!();
        assert_eq!(info.name, "core_config");
        assert!(!info.version.is_empty());
    }
}
