//! Per-worker circuit breaker.
//!
//! Protects the upstream provider from hammering during sustained failure:
//!
//! ```text
//! ┌─────────┐ failure ratio over volume ┌────────┐
//! │ CLOSED  │ ────────────────────────> │  OPEN  │
//! └─────────┘                           └────────┘
//!      ^                                     │
//!      │                                     │ open_duration elapsed
//!      │                                     v
//!      │   all probes succeed      ┌─────────────┐
//!      └────────────────────────── │  HALF-OPEN  │
//!                                  └─────────────┘
//!                                        │
//!                      first probe failure
//!                      ──────────────────┘
//! ```
//!
//! CLOSED evaluates a tumbling window: once `volume_threshold` outcomes have
//! been recorded, the failure ratio is compared against `failure_ratio`;
//! the window then restarts either way. HALF-OPEN admits at most
//! `half_open_probes` trial calls.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Minimum recorded outcomes before the failure ratio is evaluated.
    pub volume_threshold: u32,
    /// Open when failures / (failures + successes) reaches this ratio.
    pub failure_ratio: f64,
    /// Cool-down before OPEN transitions to HALF-OPEN.
    pub open_duration: Duration,
    /// Trial calls admitted while HALF-OPEN.
    pub half_open_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            volume_threshold: 10,
            failure_ratio: 0.5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

impl BreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_volume_threshold(mut self, threshold: u32) -> Self {
        self.volume_threshold = threshold.max(1);
        self
    }

    pub fn with_failure_ratio(mut self, ratio: f64) -> Self {
        self.failure_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    pub fn with_half_open_probes(mut self, probes: u32) -> Self {
        self.half_open_probes = probes.max(1);
        self
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A bounded number of probe requests test recovery.
    HalfOpen,
}

impl BreakerState {
    /// Persisted representation (heartbeats, breaker mirror hash).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probes_issued: u32,
    probe_successes: u32,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            opened_at_wall: None,
            probes_issued: 0,
            probe_successes: 0,
        }
    }

    fn open(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.failure_count = 0;
        self.success_count = 0;
        self.probes_issued = 0;
        self.probe_successes = 0;
    }

    fn close(&mut self) {
        *self = Self::new();
    }
}

/// Read-only view of the breaker, mirrored into the store and heartbeats.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

/// Thread-safe per-worker circuit breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: RwLock<Inner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Create a circuit breaker with default configuration.
    pub fn default_config() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Get the current state.
    pub fn state(&self) -> BreakerState {
        self.inner.read().unwrap().state
    }

    /// Check if a call may proceed; consumes a probe slot while HALF-OPEN.
    ///
    /// Returns `false` while OPEN (fail fast) or when the half-open probe
    /// budget is exhausted.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.write().unwrap();

        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.config.open_duration);
                if elapsed >= self.config.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_issued = 1;
                    inner.probe_successes = 0;
                    tracing::info!("Circuit breaker HALF-OPEN (testing recovery)");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_issued < self.config.half_open_probes {
                    inner.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.write().unwrap();

        match inner.state {
            BreakerState::Closed => {
                inner.success_count += 1;
                self.evaluate_window(&mut inner);
            }
            BreakerState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.half_open_probes {
                    inner.close();
                    tracing::info!("Circuit breaker CLOSED (recovered)");
                }
            }
            BreakerState::Open => {
                // Late result from a call issued before the trip; ignore.
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.write().unwrap();

        match inner.state {
            BreakerState::Closed => {
                inner.failure_count += 1;
                self.evaluate_window(&mut inner);
            }
            BreakerState::HalfOpen => {
                // Any probe failure reopens the circuit
                inner.open();
                tracing::warn!("Circuit breaker OPENED (probe failed)");
            }
            BreakerState::Open => {}
        }
    }

    /// Evaluate the tumbling window once enough volume has accumulated.
    fn evaluate_window(&self, inner: &mut Inner) {
        let volume = inner.failure_count + inner.success_count;
        if volume < self.config.volume_threshold {
            return;
        }

        let ratio = inner.failure_count as f64 / volume as f64;
        if ratio >= self.config.failure_ratio {
            inner.open();
            tracing::warn!(
                failures = inner.failure_count,
                volume = volume,
                "Circuit breaker OPENED"
            );
        } else {
            // Window complete without a trip; start a fresh one
            inner.failure_count = 0;
            inner.success_count = 0;
        }
    }

    /// Reset to CLOSED with empty counters (control-plane broadcast).
    pub fn reset(&self) {
        self.inner.write().unwrap().close();
        tracing::info!("Circuit breaker reset to CLOSED");
    }

    /// Force OPEN immediately (control-plane broadcast).
    pub fn force_open(&self) {
        self.inner.write().unwrap().open();
        tracing::warn!("Circuit breaker forced OPEN");
    }

    /// Snapshot for heartbeats and the mirrored store hash.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.read().unwrap();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_at: inner.opened_at_wall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(volume: u32, ratio: f64, open_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            volume_threshold: volume,
            failure_ratio: ratio,
            open_duration: Duration::from_millis(open_ms),
            half_open_probes: probes,
        })
    }

    #[test]
    fn test_initial_state() {
        let breaker = CircuitBreaker::default_config();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_opens_when_ratio_exceeded_at_volume() {
        let breaker = breaker(4, 0.5, 60_000, 1);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // 4th outcome completes the window: 3/4 failures >= 0.5
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_window_resets_below_ratio() {
        let breaker = breaker(4, 0.5, 60_000, 1);

        breaker.record_failure();
        breaker.record_success();
        breaker.record_success();
        breaker.record_success();
        // Window of 4 with 25% failures: stays closed, counters restart
        assert_eq!(breaker.state(), BreakerState::Closed);

        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.success_count, 0);
    }

    #[test]
    fn test_no_evaluation_below_volume_threshold() {
        let breaker = breaker(10, 0.1, 60_000, 1);

        for _ in 0..9 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown_and_close_on_probe_success() {
        let breaker = breaker(1, 0.5, 10, 1);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_probe_budget() {
        let breaker = breaker(1, 0.5, 10, 2);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));

        // Two probes allowed, third denied while results are pending
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute());

        // One success is not enough to close with two probes required
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = breaker(1, 0.5, 10, 2);

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn test_reset_and_force_open() {
        let breaker = CircuitBreaker::default_config();

        breaker.force_open();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.snapshot().opened_at.is_some());

        breaker.reset();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_execute());
    }

    #[test]
    fn test_state_as_str() {
        assert_eq!(BreakerState::Closed.as_str(), "CLOSED");
        assert_eq!(BreakerState::Open.as_str(), "OPEN");
        assert_eq!(BreakerState::HalfOpen.as_str(), "HALF_OPEN");
    }
}
