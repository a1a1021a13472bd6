// library entry
pub mod algorithms;
pub mod clock;
pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod logging;
pub mod resilience;
pub mod rules;
pub mod storage;

#[cfg(test)]
mod test_utils;

#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use algorithms::{RateLimitAlgorithm, RateLimitStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AlgorithmConfig, FailurePolicy, GatekeeperConfig};
pub use error::{RateLimiterError, Result};
pub use gatekeeper::middleware::{rate_limit, CallerIdentity};
pub use gatekeeper::{Decision, Gatekeeper, RateLimitHeaders};
pub use logging::init as init_logging;
pub use rules::{EndpointRule, RequestInfo};
pub use storage::CounterStore;
