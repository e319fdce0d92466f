//! Fault management: circuit breaker and token-bucket rate limiting.

pub mod breaker;
pub mod limiter;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use limiter::{LimitDecision, RateLimiter};
