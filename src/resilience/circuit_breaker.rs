use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::duration_serde;
use crate::error::{RateLimiterError, Result};

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, store calls flow normally
    Closed,
    /// Circuit is open, store calls are skipped and the failure policy applies
    Open,
    /// Circuit is probing, store calls are let through to test recovery
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    #[serde(with = "duration_serde")]
    pub reset_timeout: Duration,
    /// Number of consecutive successes while probing that close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(RateLimiterError::Config(
                "circuitBreaker thresholds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at_ms: u64,
}

/// Circuit breaker guarding counter store calls
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at_ms: 0,
            }),
            clock,
            config,
        }
    }

    /// Check if the circuit breaker allows the store call to proceed
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self.clock.now_ms().saturating_sub(inner.opened_at_ms);
                if elapsed >= self.config.reset_timeout.as_millis() as u64 {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    debug!("Circuit breaker state transitioned to half-open");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful store call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.success_count = 0;
                    inner.failure_count = 0;
                    debug!("Circuit breaker closed after successful trial calls");
                }
            }
            // a call admitted before the circuit opened finished late
            CircuitState::Open => {}
        }
    }

    /// Record a failed store call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at_ms = self.clock.now_ms();
                    warn!(
                        failures = inner.failure_count,
                        "Circuit breaker opened after consecutive store failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at_ms = self.clock.now_ms();
                inner.success_count = 0;
                warn!("Circuit breaker re-opened after failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}
