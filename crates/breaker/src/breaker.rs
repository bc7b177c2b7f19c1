use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::error::{BreakerError, CallError};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the breaker for monitoring.
#[derive(Debug, Clone)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct CircuitState {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// Outcome classification used to update the circuit after a call.
enum Verdict {
    Success,
    Failure,
    Rejected,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    circuit: Mutex<CircuitState>,
    permits: Semaphore,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Result<Self, BreakerError> {
        cfg.validate()?;
        let name = name.into();

        tracing::debug!(
            breaker = %name,
            failure_threshold = cfg.failure_threshold,
            recovery_timeout = ?cfg.recovery_timeout,
            call_timeout = ?cfg.call_timeout,
            max_concurrent = cfg.max_concurrent,
            "Initialized circuit breaker"
        );

        Ok(Self {
            name,
            permits: Semaphore::new(cfg.max_concurrent),
            cfg,
            circuit: Mutex::new(CircuitState {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                half_open_in_flight: 0,
            }),
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    /// Current state, moving Open to HalfOpen once the recovery timeout has
    /// elapsed.
    pub fn state(&self) -> BreakerState {
        let mut circuit = self.circuit.lock().expect("poisoned");
        self.refresh(&mut circuit);
        circuit.state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut circuit = self.circuit.lock().expect("poisoned");
        self.refresh(&mut circuit);
        BreakerStats {
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit closed and forget past failures.
    pub fn reset(&self) {
        let mut circuit = self.circuit.lock().expect("poisoned");
        circuit.state = BreakerState::Closed;
        circuit.consecutive_failures = 0;
        circuit.opened_at = None;
        circuit.half_open_in_flight = 0;
    }

    /// Run `operation` through the breaker under the configured call timeout.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.call_with_timeout(self.cfg.call_timeout, operation)
            .await
    }

    /// Run `operation` with its own deadline, capped at the configured call
    /// timeout.
    ///
    /// Waiting for a concurrency permit counts against the deadline.
    pub async fn call_with_timeout<F, Fut, T, E>(
        &self,
        deadline: Duration,
        operation: F,
    ) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let probing = match self.admit() {
            Some(probing) => probing,
            None => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
                return Err(CallError::Open);
            }
        };
        let slot = CallSlot {
            breaker: self,
            probing,
        };

        let limit = deadline.min(self.cfg.call_timeout);
        let guarded = async {
            let _permit = self.permits.acquire().await.map_err(|_| CallError::Open)?;
            operation().await.map_err(CallError::Inner)
        };
        let result = match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Timeout(limit)),
        };

        let verdict = match &result {
            Ok(_) => Verdict::Success,
            Err(CallError::Open) => Verdict::Rejected,
            Err(_) => Verdict::Failure,
        };
        slot.finish(verdict);
        result
    }

    fn refresh(&self, circuit: &mut CircuitState) {
        if circuit.state != BreakerState::Open {
            return;
        }
        let recovered = circuit
            .opened_at
            .map_or(true, |opened| opened.elapsed() >= self.cfg.recovery_timeout);
        if recovered {
            circuit.state = BreakerState::HalfOpen;
            circuit.half_open_in_flight = 0;
            tracing::info!(breaker = %self.name, "Circuit half-open, admitting probe calls");
        }
    }

    /// Returns `Some(is_probe)` when the call may proceed.
    fn admit(&self) -> Option<bool> {
        let mut circuit = self.circuit.lock().expect("poisoned");
        self.refresh(&mut circuit);
        match circuit.state {
            BreakerState::Closed => Some(false),
            BreakerState::Open => None,
            BreakerState::HalfOpen => {
                if circuit.half_open_in_flight >= self.cfg.half_open_max_calls {
                    None
                } else {
                    circuit.half_open_in_flight += 1;
                    Some(true)
                }
            }
        }
    }

    fn release_probe(&self) {
        let mut circuit = self.circuit.lock().expect("poisoned");
        circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
    }

    fn record(&self, verdict: Verdict, probing: bool) {
        let mut circuit = self.circuit.lock().expect("poisoned");
        if probing {
            circuit.half_open_in_flight = circuit.half_open_in_flight.saturating_sub(1);
        }
        match verdict {
            Verdict::Success => {
                if circuit.state != BreakerState::Closed {
                    tracing::info!(breaker = %self.name, "Circuit closed after successful probe");
                }
                circuit.state = BreakerState::Closed;
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
            }
            Verdict::Failure => {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                circuit.consecutive_failures += 1;
                let trip = circuit.state == BreakerState::HalfOpen
                    || circuit.consecutive_failures >= self.cfg.failure_threshold;
                if trip && circuit.state != BreakerState::Open {
                    tracing::warn!(
                        breaker = %self.name,
                        consecutive_failures = circuit.consecutive_failures,
                        recovery_timeout = ?self.cfg.recovery_timeout,
                        "Circuit opened"
                    );
                    circuit.state = BreakerState::Open;
                    circuit.opened_at = Some(Instant::now());
                }
            }
            Verdict::Rejected => {
                self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Admission ticket for one call. A call future dropped before it finishes
/// gives its half-open probe slot back without recording a verdict.
struct CallSlot<'a> {
    breaker: &'a CircuitBreaker,
    probing: bool,
}

impl CallSlot<'_> {
    fn finish(mut self, verdict: Verdict) {
        let probing = std::mem::take(&mut self.probing);
        self.breaker.record(verdict, probing);
    }
}

impl Drop for CallSlot<'_> {
    fn drop(&mut self) {
        if self.probing {
            self.breaker.release_probe();
        }
    }
}
