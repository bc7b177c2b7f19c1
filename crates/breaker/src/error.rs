use std::fmt;
use std::time::Duration;

use derive_more::Display;

/// Errors raised while constructing a breaker.
#[derive(Debug, Display)]
pub enum BreakerError {
    /// Configuration is invalid or inconsistent.
    #[display("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

impl core::error::Error for BreakerError {}

impl BreakerError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

/// Why a guarded call did not produce the operation's value.
#[derive(Debug)]
pub enum CallError<E> {
    /// The circuit is open (or a half-open probe is already running).
    Open,
    /// The call exceeded the breaker's per-call deadline.
    Timeout(Duration),
    /// The operation ran and returned an error.
    Inner(E),
}

impl<E> CallError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("circuit breaker is open"),
            Self::Timeout(limit) => write!(f, "call timed out after {limit:?}"),
            Self::Inner(err) => write!(f, "{err}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> core::error::Error for CallError<E> {}
