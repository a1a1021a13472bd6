// src/resilience/mod.rs
//! Resilience features for the gatekeeper.
//!
//! - **Health Checks** actively monitor the shared store so `is_connected()`
//!   reflects reality between requests.
//! - **Circuit Breaking** stops sending store calls once they keep failing and
//!   lets the failure policy answer instead.
//!
//! Falling back to the in-process store when Redis is unreachable at startup
//! lives in [`crate::storage::connect`].

mod circuit_breaker;
mod health_checker;

#[cfg(test)]
mod tests;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use health_checker::{HealthCheckConfig, HealthChecker, HealthCheck};
