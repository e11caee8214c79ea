//! Error types for the broker core.
//!
//! This module provides:
//! - `BrokerError` - the structured error surface of broker operations
//! - `ErrorClass` - classification of task failures for retry routing
//! - `HandlerError` - the error contract handlers report failures through

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by broker operations.
///
/// Every variant maps to a stable code via [`BrokerError::code`] so the
/// ingress collaborator can return structured errors without string matching.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Store connection or command error.
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Task record does not exist.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Compare-and-swap on the task state observed a different state.
    #[error("State conflict for task {task_id}: expected {expected}, found {found}")]
    Conflict {
        task_id: String,
        expected: String,
        found: String,
    },

    /// A task with this id already exists.
    #[error("Task already exists: {0}")]
    AlreadyExists(String),

    /// Client-origin validation failure (bad arguments, unknown task type).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Token acquisition did not succeed within the allowed wait.
    #[error("Rate limit acquire timed out after {0:?}")]
    RateLimitTimeout(Duration),

    /// The circuit breaker is open; the call was not attempted.
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// No handler is registered for the task type.
    #[error("No handler registered for task type '{0}'")]
    DependencyMissing(String),

    /// Core logic bug; the affected task is dead-lettered, never dropped.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable error code for the ingress surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(_) | Self::Serialization(_) | Self::Internal(_) => "Internal",
            Self::NotFound(_) => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Validation(_) => "ValidationError",
            Self::RateLimitTimeout(_) => "RateLimitTimeout",
            Self::CircuitOpen => "CircuitOpen",
            Self::DependencyMissing(_) => "DependencyMissing",
        }
    }
}

/// Result type alias for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Subtype of a permanent failure. Retrying cannot help these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentKind {
    /// Payload/arguments violate the handler's schema.
    Validation,
    /// Upstream rejected credentials (401).
    Auth,
    /// Upstream forbade or cannot find the resource (403/404).
    Forbidden,
    /// Upstream flagged a content policy violation.
    ContentPolicy,
    /// A required external dependency is missing (tool, handler).
    Dependency,
}

/// Subtype of a transient failure. Retried on a class-specific schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    /// Upstream rate limit (429).
    RateLimit,
    /// Upstream 5xx.
    ServiceUnavailable,
    /// Upstream 402 / credits exhausted.
    Credits,
    /// Network timeout or connection reset.
    Network,
    /// Local circuit breaker rejected the call. Never counts as a retry.
    CircuitOpen,
    /// Per-task deadline exceeded.
    Timeout,
    /// Anything unrecognized.
    Default,
}

/// Failure classification driving retry and DLQ routing.
///
/// The persisted `error_type` tag is the full stable identifier
/// (e.g. `Permanent/Auth`, `Transient/RateLimit`, `Internal`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent(PermanentKind),
    Transient(TransientKind),
    Internal,
}

impl ErrorClass {
    /// Stable classification tag, persisted in `error_type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Permanent(PermanentKind::Validation) => "Permanent/Validation",
            Self::Permanent(PermanentKind::Auth) => "Permanent/Auth",
            Self::Permanent(PermanentKind::Forbidden) => "Permanent/Forbidden",
            Self::Permanent(PermanentKind::ContentPolicy) => "Permanent/ContentPolicy",
            Self::Permanent(PermanentKind::Dependency) => "Permanent/Dependency",
            Self::Transient(TransientKind::RateLimit) => "Transient/RateLimit",
            Self::Transient(TransientKind::ServiceUnavailable) => "Transient/ServiceUnavailable",
            Self::Transient(TransientKind::Credits) => "Transient/Credits",
            Self::Transient(TransientKind::Network) => "Transient/Network",
            Self::Transient(TransientKind::CircuitOpen) => "Transient/CircuitOpen",
            Self::Transient(TransientKind::Timeout) => "Transient/Timeout",
            Self::Transient(TransientKind::Default) => "Transient/Default",
            Self::Internal => "Internal",
        }
    }

    /// Whether this class is ever retried.
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether a retry of this class consumes the task's retry budget.
    ///
    /// Circuit-open rejections requeue without touching `retry_count`.
    pub fn increments_retry_count(&self) -> bool {
        matches!(self, Self::Transient(kind) if *kind != TransientKind::CircuitOpen)
    }

    /// Class-specific backoff schedule, in seconds per attempt.
    ///
    /// Attempt `k` sleeps `schedule[min(k, len - 1)]` seconds before jitter.
    pub fn schedule(&self) -> &'static [u64] {
        match self {
            Self::Transient(TransientKind::RateLimit) => &[60, 120, 300, 600],
            Self::Transient(TransientKind::ServiceUnavailable) => &[5, 10, 30, 60, 120],
            Self::Transient(TransientKind::Credits) => &[300, 600, 1800],
            Self::Transient(TransientKind::Network) => &[2, 5, 10, 30, 60],
            _ => &[5, 15, 60, 300],
        }
    }

    /// Delay before attempt `k` (0-indexed), with jitter in [0, 0.1].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let schedule = self.schedule();
        let index = (attempt as usize).min(schedule.len() - 1);
        let base_secs = schedule[index] as f64;
        let jitter: f64 = rand::random::<f64>() * 0.1;
        Duration::from_secs_f64(base_secs * (1.0 + jitter))
    }
}

/// Error reported by a task handler.
///
/// Carries a classification tag (advisory; the retry router has final say),
/// a human message, an optional upstream status code, and an optional
/// retryable hint.
#[derive(Debug, Clone)]
pub struct HandlerError {
    /// Advisory classification from the handler.
    pub class: ErrorClass,
    /// Human-readable message, persisted into the task's error history.
    pub message: String,
    /// Upstream HTTP status, when the failure came from a provider call.
    pub status: Option<u16>,
    /// Advisory retryable hint.
    pub retryable: Option<bool>,
}

impl HandlerError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            status: None,
            retryable: None,
        }
    }

    /// Attach the upstream status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an advisory retryable hint.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent(PermanentKind::Validation), message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent(PermanentKind::Auth), message)
    }

    pub fn content_policy(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent(PermanentKind::ContentPolicy), message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Permanent(PermanentKind::Dependency), message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient(TransientKind::RateLimit), message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(
            ErrorClass::Transient(TransientKind::ServiceUnavailable),
            message,
        )
    }

    pub fn credits(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient(TransientKind::Credits), message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient(TransientKind::Network), message)
    }

    pub fn circuit_open() -> Self {
        Self::new(
            ErrorClass::Transient(TransientKind::CircuitOpen),
            "circuit breaker is open",
        )
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient(TransientKind::Timeout), message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient(TransientKind::Default), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Internal, message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.class.as_str(), self.message)
    }
}

impl std::error::Error for HandlerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_codes() {
        assert_eq!(BrokerError::NotFound("t".into()).code(), "NotFound");
        assert_eq!(BrokerError::AlreadyExists("t".into()).code(), "AlreadyExists");
        assert_eq!(
            BrokerError::Validation("bad".into()).code(),
            "ValidationError"
        );
        assert_eq!(
            BrokerError::RateLimitTimeout(Duration::from_secs(1)).code(),
            "RateLimitTimeout"
        );
        assert_eq!(BrokerError::CircuitOpen.code(), "CircuitOpen");
        assert_eq!(
            BrokerError::DependencyMissing("pdf".into()).code(),
            "DependencyMissing"
        );
        assert_eq!(BrokerError::Internal("bug".into()).code(), "Internal");
    }

    #[test]
    fn test_error_class_tags() {
        assert_eq!(
            ErrorClass::Permanent(PermanentKind::Auth).as_str(),
            "Permanent/Auth"
        );
        assert_eq!(
            ErrorClass::Transient(TransientKind::RateLimit).as_str(),
            "Transient/RateLimit"
        );
        assert_eq!(ErrorClass::Internal.as_str(), "Internal");
    }

    #[test]
    fn test_should_retry() {
        assert!(ErrorClass::Transient(TransientKind::Network).should_retry());
        assert!(ErrorClass::Transient(TransientKind::CircuitOpen).should_retry());
        assert!(!ErrorClass::Permanent(PermanentKind::Validation).should_retry());
        assert!(!ErrorClass::Internal.should_retry());
    }

    #[test]
    fn test_circuit_open_never_consumes_retry_budget() {
        assert!(!ErrorClass::Transient(TransientKind::CircuitOpen).increments_retry_count());
        assert!(ErrorClass::Transient(TransientKind::Network).increments_retry_count());
        assert!(!ErrorClass::Permanent(PermanentKind::Auth).increments_retry_count());
    }

    #[test]
    fn test_schedules_match_classes() {
        assert_eq!(
            ErrorClass::Transient(TransientKind::RateLimit).schedule(),
            &[60, 120, 300, 600]
        );
        assert_eq!(
            ErrorClass::Transient(TransientKind::ServiceUnavailable).schedule(),
            &[5, 10, 30, 60, 120]
        );
        assert_eq!(
            ErrorClass::Transient(TransientKind::Credits).schedule(),
            &[300, 600, 1800]
        );
        assert_eq!(
            ErrorClass::Transient(TransientKind::Network).schedule(),
            &[2, 5, 10, 30, 60]
        );
        assert_eq!(
            ErrorClass::Transient(TransientKind::Default).schedule(),
            &[5, 15, 60, 300]
        );
    }

    #[test]
    fn test_delay_clamps_to_last_schedule_entry() {
        let class = ErrorClass::Transient(TransientKind::Network);
        // Attempt far past the schedule end uses the last entry (60s),
        // jitter adds at most 10%.
        let delay = class.delay_for_attempt(99);
        assert!(delay >= Duration::from_secs(60));
        assert!(delay <= Duration::from_secs_f64(66.0 + 0.001));
    }

    #[test]
    fn test_delay_first_attempt_with_jitter_bounds() {
        let class = ErrorClass::Transient(TransientKind::Network);
        for _ in 0..20 {
            let delay = class.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs_f64(2.2 + 0.001));
        }
    }

    #[test]
    fn test_handler_error_display() {
        let err = HandlerError::auth("key rejected").with_status(401);
        assert_eq!(err.to_string(), "Permanent/Auth: key rejected");
        assert_eq!(err.status, Some(401));
    }
}
