use std::time::Duration;

use crate::BreakerError;
use crate::Result;

/// Tuning knobs for [`crate::CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a probe call is admitted
    pub recovery_timeout: Duration,
    /// Hard deadline for a single call
    pub call_timeout: Duration,
    /// Maximum calls executing at once
    pub max_concurrent: usize,
    /// Probe calls admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(300),
            max_concurrent: 8,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), BreakerError> {
        if self.failure_threshold == 0 {
            return Err(error_stack::report!(BreakerError::invalid_config(
                "failure_threshold must be at least 1"
            )));
        }
        if self.max_concurrent == 0 {
            return Err(error_stack::report!(BreakerError::invalid_config(
                "max_concurrent must be at least 1"
            )));
        }
        if self.call_timeout.is_zero() {
            return Err(error_stack::report!(BreakerError::invalid_config(
                "call_timeout must be non-zero"
            )));
        }
        if self.half_open_max_calls == 0 {
            return Err(error_stack::report!(BreakerError::invalid_config(
                "half_open_max_calls must be at least 1"
            )));
        }
        Ok(())
    }
}
