//! Circuit breaker guarding GPU job execution.
//!
//! [`CircuitBreaker::call`] runs an async operation under three protections:
//! - a failure counter that opens the circuit after `failure_threshold`
//!   consecutive failures and lets a probe through after `recovery_timeout`
//! - a hard per-call timeout
//! - a concurrency cap of `max_concurrent` in-flight calls

use error_stack::Report;

mod breaker;
mod config;
mod error;

/// Result type using error-stack for context-rich error reporting
pub type Result<T, C> = core::result::Result<T, Report<C>>;

pub use breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use config::CircuitBreakerConfig;
pub use error::{BreakerError, CallError};
