//! Handler contract and registry.
//!
//! Payloads are opaque to the core; a handler registered under a task type
//! gives them meaning. Delivery is at-least-once, so handlers must be
//! idempotent with respect to the task id. Provider calls go through
//! `ctx.call_provider`, which enforces the circuit breaker and the
//! distributed rate limit before the call leaves the process.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::error::{BrokerError, ErrorClass, HandlerError, TransientKind};
use crate::ratelimit::RateLimiter;

/// A task payload processor.
///
/// # Example
///
/// ```ignore
/// struct SummarizeHandler {
///     client: Arc<LlmClient>,
/// }
///
/// #[async_trait]
/// impl TaskHandler for SummarizeHandler {
///     async fn handle(
///         &self,
///         task_id: &str,
///         payload: &str,
///         ctx: &HandlerContext,
///     ) -> Result<String, HandlerError> {
///         let text = payload.to_string();
///         ctx.call_provider(|| self.client.summarize(text)).await
///     }
///
///     fn name(&self) -> &'static str {
///         "summarize"
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Process one task. The returned string is stored as the task result.
    ///
    /// Must be idempotent per task_id: the same task may be delivered more
    /// than once.
    async fn handle(
        &self,
        task_id: &str,
        payload: &str,
        ctx: &HandlerContext,
    ) -> Result<String, HandlerError>;

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}

/// Runtime table mapping task_type to its handler.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type. Later registrations win.
    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        debug!(task_type = %task_type, handler = %handler.name(), "Registered handler");
        self.handlers.insert(task_type, handler);
    }

    /// Look up the handler for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Whether a handler is registered for the task type.
    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Registered task types, for validation errors and status surfaces.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }
}

/// Breaker + rate-limit enforcement wrapped around provider calls.
///
/// The gateway gates; the dispatcher records outcomes. Keeping the
/// bookkeeping in one place means a task counts once against the breaker
/// regardless of how many provider calls its handler makes.
#[derive(Clone)]
pub struct ProviderGateway {
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    token_wait: Duration,
}

impl ProviderGateway {
    pub fn new(breaker: Arc<CircuitBreaker>, limiter: RateLimiter, token_wait: Duration) -> Self {
        Self {
            breaker,
            limiter,
            token_wait,
        }
    }

    /// Run a provider call behind the breaker and the distributed limiter.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        if !self.breaker.can_execute() {
            return Err(HandlerError::circuit_open());
        }

        match self.limiter.acquire(1, self.token_wait).await {
            Ok(()) => {}
            Err(BrokerError::RateLimitTimeout(waited)) => {
                return Err(HandlerError::new(
                    ErrorClass::Transient(TransientKind::RateLimit),
                    format!("rate limit token not granted within {:?}", waited),
                ));
            }
            Err(e) => {
                return Err(HandlerError::transient(format!(
                    "rate limiter unavailable: {}",
                    e
                )));
            }
        }

        op().await
    }
}

/// Per-attempt context handed to a handler.
#[derive(Clone)]
pub struct HandlerContext {
    task_id: String,
    worker_id: String,
    cancel: watch::Receiver<bool>,
    gateway: ProviderGateway,
}

impl HandlerContext {
    pub fn new(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        cancel: watch::Receiver<bool>,
        gateway: ProviderGateway,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            cancel,
            gateway,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether the soft deadline has asked this attempt to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Wait until cancellation is requested. Long-running handlers select
    /// on this next to their work.
    pub async fn cancelled(&self) {
        let mut cancel = self.cancel.clone();
        while !*cancel.borrow() {
            if cancel.changed().await.is_err() {
                return;
            }
        }
    }

    /// Run a provider call with automatic breaker and rate-limit
    /// enforcement.
    pub async fn call_provider<T, F, Fut>(&self, op: F) -> Result<T, HandlerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, HandlerError>>,
    {
        self.gateway.call(op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn handle(
            &self,
            _task_id: &str,
            payload: &str,
            _ctx: &HandlerContext,
        ) -> Result<String, HandlerError> {
            Ok(payload.to_string())
        }

        fn name(&self) -> &'static str {
            "noop"
        }
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(NoopHandler));

        assert!(registry.contains("echo"));
        assert!(!registry.contains("summarize"));
        assert_eq!(registry.get("echo").unwrap().name(), "noop");
        assert!(registry.get("summarize").is_none());
    }

    #[test]
    fn test_registry_task_types_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register("summarize", Arc::new(NoopHandler));
        registry.register("echo", Arc::new(NoopHandler));

        assert_eq!(registry.task_types(), vec!["echo", "summarize"]);
    }

    #[test]
    fn test_registry_later_registration_wins() {
        struct OtherHandler;

        #[async_trait]
        impl TaskHandler for OtherHandler {
            async fn handle(
                &self,
                _task_id: &str,
                _payload: &str,
                _ctx: &HandlerContext,
            ) -> Result<String, HandlerError> {
                Ok(String::new())
            }

            fn name(&self) -> &'static str {
                "other"
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(NoopHandler));
        registry.register("echo", Arc::new(OtherHandler));
        assert_eq!(registry.get("echo").unwrap().name(), "other");
    }
}
