// src/algorithms/tests/mod.rs

/// Tests for Token Bucket algorithm
mod token_bucket_tests;



/// Common tests for all algorithms
#[cfg(test)]
mod common_tests {
    use std::time::Duration;

    use crate::algorithms::build;
    use crate::clock::Clock;
    use crate::config::{AlgorithmConfig, TokenBucketConfig, WindowConfig};
    use crate::error::RateLimiterError;
    use crate::test_utils::{memory_store_with_clock, shared};

    fn equivalent_configs() -> Vec<AlgorithmConfig> {
        vec![
            AlgorithmConfig::TokenBucket(TokenBucketConfig {
                capacity: 5,
                refill_rate: 1,
                // long interval so nothing refills during the test
                refill_interval: Duration::from_secs(3600),
            }),
            AlgorithmConfig::FixedWindow(WindowConfig::new(5, Duration::from_secs(3600))),
            AlgorithmConfig::SlidingWindow(WindowConfig::new(5, Duration::from_secs(3600))),
        ]
    }

    /// Test consistent behavior across all algorithm implementations
    #[tokio::test]
    async fn test_algorithm_trait_consistency() {
        for config in equivalent_configs() {
            let (store, clock) = memory_store_with_clock();
            let limiter = build(&config, store, shared(&clock));
            let name = limiter.name();

            assert_eq!(limiter.limit(), 5);

            for i in 0..5 {
                let status = limiter.consume("user", 1).await.unwrap();
                assert!(status.allowed, "{}: request {} should be allowed", name, i);
                assert_eq!(status.remaining, 4 - i, "{}: remaining after {}", name, i);
                assert_eq!(status.limit, 5);
                assert!(status.retry_after.is_none());
            }

            let status = limiter.consume("user", 1).await.unwrap();
            assert!(!status.allowed, "{}: 6th request should be denied", name);
            assert_eq!(status.remaining, 0);
            assert!(status.retry_after.unwrap() >= 1);
            assert!(status.reset_at_ms >= clock.now_ms());

            let other = limiter.consume("other", 1).await.unwrap();
            assert!(other.allowed, "{}: different key should be allowed", name);

            limiter.reset("user").await.unwrap();
            let after_reset = limiter.consume("user", 1).await.unwrap();
            assert!(after_reset.allowed, "{}: request after reset should be allowed", name);
        }
    }

    /// check() reports without recording
    #[tokio::test]
    async fn test_check_does_not_consume() {
        for config in equivalent_configs() {
            let (store, clock) = memory_store_with_clock();
            let limiter = build(&config, store, shared(&clock));
            let name = limiter.name();

            for _ in 0..10 {
                let status = limiter.check("user").await.unwrap();
                assert!(status.allowed, "{}: check should not consume", name);
                assert_eq!(status.remaining, 5);
            }

            for _ in 0..5 {
                assert!(limiter.consume("user", 1).await.unwrap().allowed);
            }

            let status = limiter.check("user").await.unwrap();
            assert!(!status.allowed, "{}: check should see exhaustion", name);
            assert_eq!(status.remaining, 0);
            assert!(status.retry_after.is_some());
        }
    }

    /// A request costing more than what is left is rejected whole
    #[tokio::test]
    async fn test_weighted_request_is_all_or_nothing() {
        for config in equivalent_configs() {
            let (store, clock) = memory_store_with_clock();
            let limiter = build(&config, store, shared(&clock));
            let name = limiter.name();

            assert!(limiter.consume("user", 3).await.unwrap().allowed);
            let status = limiter.consume("user", 3).await.unwrap();
            assert!(!status.allowed, "{}: 3 + 3 exceeds 5", name);
        }
    }

    /// A cost no limit could ever admit is an error, and records nothing
    #[tokio::test]
    async fn test_cost_above_limit_is_an_error() {
        for config in equivalent_configs() {
            let (store, clock) = memory_store_with_clock();
            let limiter = build(&config, store, shared(&clock));
            let name = limiter.name();

            for cost in [6, u64::MAX] {
                let err = limiter.consume("user", cost).await.unwrap_err();
                assert!(
                    matches!(err, RateLimiterError::Algorithm(_)),
                    "{}: cost {} gave {:?}",
                    name,
                    cost,
                    err
                );
            }

            let status = limiter.check("user").await.unwrap();
            assert_eq!(status.remaining, 5, "{}: failed calls must not count", name);
            assert!(limiter.consume("user", 5).await.unwrap().allowed, "{}", name);
        }
    }
}
