//! Resilience patterns shared by the control plane clients

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerConfig, CircuitBreakerState,
    CircuitBreakerStats,
};
pub use retry::{cancellable_sleep, retry, BackoffStrategy, RetryConfig};
