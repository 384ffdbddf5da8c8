//! Consecutive-failure circuit breaker
//!
//! The breaker has two states:
//! - **Closed**: requests pass through and failures are counted
//! - **Open**: requests are rejected with [`NimbusError::CircuitOpen`] until the
//!   open window elapses, after which the breaker resets to closed
//!
//! There is no half-open probe. Only failures for which
//! [`NimbusError::counts_as_breaker_failure`] holds are counted, so a healthy
//! upstream that rejects a bad request does not trip the breaker.
//!
//! ```rust
//! use std::time::Duration;
//! use nimbus_core::patterns::{CircuitBreakerBuilder, CircuitBreakerState};
//!
//! let breaker = CircuitBreakerBuilder::new("control-plane")
//!     .failure_threshold(2)
//!     .open_duration(Duration::from_secs(30))
//!     .build();
//!
//! breaker.record_failure();
//! breaker.record_failure();
//! assert_eq!(breaker.state(), CircuitBreakerState::Open);
//! assert!(breaker.try_acquire().is_err());
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{NimbusError, NimbusResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub times_opened: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Failure-counting breaker shared by every caller of one upstream.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,

    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
    times_opened: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::default()),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
            times_opened: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admit a request, or fail fast while the circuit is open.
    ///
    /// An expired open window is cleared here, closing the circuit.
    pub fn try_acquire(&self) -> NimbusResult<()> {
        let mut state = self.state.lock();
        if let Some(until) = state.open_until {
            if Instant::now() < until {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Err(NimbusError::CircuitOpen {
                    name: self.name.clone(),
                });
            }
            state.open_until = None;
            state.consecutive_failures = 0;
            info!("Circuit breaker '{}' closed after open window elapsed", self.name);
        }
        Ok(())
    }

    pub fn record_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        state.consecutive_failures += 1;

        if state.consecutive_failures >= self.config.failure_threshold.max(1) {
            state.open_until = Some(Instant::now() + self.config.open_duration);
            state.consecutive_failures = 0;
            self.times_opened.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Circuit breaker '{}' opening for {:?} after {} consecutive failures",
                self.name, self.config.open_duration, self.config.failure_threshold
            );
        }
    }

    /// Record the outcome of one upstream attempt.
    pub fn record<T>(&self, result: &NimbusResult<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.counts_as_breaker_failure() => self.record_failure(),
            Err(_) => self.record_success(),
        }
    }

    /// Run one operation through the breaker.
    pub async fn call<F, Fut, T>(&self, operation: F) -> NimbusResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = NimbusResult<T>>,
    {
        self.try_acquire()?;
        let result = operation().await;
        self.record(&result);
        result
    }

    pub fn state(&self) -> CircuitBreakerState {
        let state = self.state.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => CircuitBreakerState::Open,
            _ => CircuitBreakerState::Closed,
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let consecutive_failures = self.state.lock().consecutive_failures;
        CircuitBreakerStats {
            state: self.state(),
            consecutive_failures,
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            times_opened: self.times_opened.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
        }
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    pub fn open_duration(mut self, duration: Duration) -> Self {
        self.config.open_duration = duration;
        self
    }

    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.name, self.config)
    }
}
