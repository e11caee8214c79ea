//! Tracing bootstrap for worker processes.
//!
//! One call at startup wires the whole stack: an env filter with
//! broker-appropriate defaults, a `tracing-error` span layer (so errors
//! wrapped at the binary boundary carry their span trace), and a format
//! layer chosen by environment - JSON for fleet members whose logs feed an
//! aggregator, pretty-printed for a developer terminal.
//!
//! `RUST_LOG` overrides the defaults entirely (e.g.
//! `RUST_LOG=task_broker=trace,store=debug`).

use tracing::{debug, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::Environment;

/// Default filter when `RUST_LOG` is unset.
///
/// The store driver is chatty at debug level during blocking pops, so it
/// stays one notch quieter than our own crates in both environments.
fn default_filter(environment: &Environment) -> EnvFilter {
    if environment.is_production() {
        EnvFilter::new("info,redis=warn,tower_http=info")
    } else {
        EnvFilter::new("debug,redis=info,tower_http=debug")
    }
}

/// Initialize tracing for a worker process.
///
/// Infallible: a second call (common when tests share a process) is a
/// no-op.
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(environment));

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default());

    let result = if environment.is_production() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
    };

    match result {
        Ok(()) => info!(environment = environment.as_str(), "Tracing initialized"),
        Err(_) => debug!("Tracing already initialized, keeping existing subscriber"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let env = Environment::Development;
        init_tracing(&env);
        init_tracing(&env);
        init_tracing(&Environment::Production);
    }

    #[test]
    fn test_rust_log_override_wins() {
        temp_env::with_var("RUST_LOG", Some("task_broker=trace"), || {
            init_tracing(&Environment::Production);
        });
    }
}
