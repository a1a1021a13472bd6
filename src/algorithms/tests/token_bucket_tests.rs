#[cfg(test)]
mod tests {
    use futures::future::join_all;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{
        algorithms::{token_bucket::BucketState, RateLimitAlgorithm, TokenBucket},
        clock::Clock,
        config::TokenBucketConfig,
        error::RateLimiterError,
        storage::CounterStore,
        test_utils::{count_admitted, memory_store_with_clock, shared, TEST_EPOCH_MS},
    };

    fn config(capacity: u64, refill_rate: u64, interval_ms: u64) -> TokenBucketConfig {
        TokenBucketConfig {
            capacity,
            refill_rate,
            refill_interval: Duration::from_millis(interval_ms),
        }
    }

    /// Test token consumption and token depletion
    #[tokio::test]
    async fn test_token_consumption_and_depletion() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(5, 1, 1_000));

        for i in 0..5 {
            let result = bucket.consume("consumption_test_user", 1).await.unwrap();
            assert!(result.allowed, "Request {} should be allowed", i);
            assert_eq!(result.remaining, 5 - i - 1);
        }

        let result = bucket.consume("consumption_test_user", 1).await.unwrap();
        assert!(!result.allowed, "Request when tokens depleted should be denied");
        assert_eq!(result.remaining, 0);
        assert_eq!(result.retry_after, Some(1));

        let result = bucket.consume("consumption_different_user", 1).await.unwrap();
        assert!(result.allowed, "Different user should be allowed");
        assert_eq!(result.remaining, 4);
    }

    /// Whole intervals refill, partial ones do not
    #[tokio::test]
    async fn test_token_regeneration_over_time() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(5, 1, 1_000));

        for _ in 0..5 {
            bucket.consume("user", 1).await.unwrap();
        }

        clock.advance(Duration::from_millis(999));
        assert!(!bucket.consume("user", 1).await.unwrap().allowed);

        clock.advance(Duration::from_millis(1));
        let status = bucket.consume("user", 1).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 0);

        // the 999ms were not lost: refill boundaries stay aligned to whole intervals
        clock.advance(Duration::from_millis(1_000));
        assert!(bucket.consume("user", 1).await.unwrap().allowed);
    }

    /// The bucket never holds more than its capacity
    #[tokio::test]
    async fn test_refill_caps_at_capacity() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(5, 2, 100));

        for _ in 0..5 {
            bucket.consume("user", 1).await.unwrap();
        }
        clock.advance(Duration::from_secs(60));

        let admitted = count_admitted(&bucket, &clock, "user", 10, Duration::ZERO).await;
        assert_eq!(admitted, 5);
    }

    #[tokio::test]
    async fn test_three_tokens_after_three_seconds() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(5, 1, 1_000));

        for _ in 0..5 {
            clock.advance(Duration::from_millis(20));
            assert!(bucket.consume("user", 1).await.unwrap().allowed);
        }

        clock.advance(Duration::from_millis(3_000));
        assert_eq!(bucket.check("user").await.unwrap().remaining, 3);
        assert_eq!(count_admitted(&bucket, &clock, "user", 5, Duration::ZERO).await, 3);
    }

    /// Bursts up to capacity, then the steady rate
    #[tokio::test]
    async fn test_sustained_rate_after_burst() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(10, 1, 100));

        // 10 burst, then one every 100ms over 2s
        let admitted = count_admitted(&bucket, &clock, "user", 40, Duration::from_millis(50)).await;
        assert_eq!(admitted, 10 + 19);
    }

    /// retry_after covers the missing tokens, reset_at the time to full
    #[tokio::test]
    async fn test_retry_after_and_reset_at() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(10, 2, 500));

        let drained = bucket.consume("user", 10).await.unwrap();
        assert!(drained.allowed);
        assert_eq!(drained.remaining, 0);
        // 10 tokens at 2 per 500ms
        assert_eq!(drained.reset_at_ms, TEST_EPOCH_MS + 2_500);

        // 5 missing tokens need 3 intervals
        let denied = bucket.consume("user", 5).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(2));

        clock.advance(Duration::from_millis(1_500));
        let status = bucket.consume("user", 5).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 1);
    }

    /// A full bucket reports a reset time of now, never in the past
    #[tokio::test]
    async fn test_reset_at_is_not_in_the_past() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(3, 1, 1_000));

        clock.advance(Duration::from_millis(1_234));
        let status = bucket.check("fresh").await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.reset_at_ms, clock.now_ms());
    }

    /// Denied requests leave the bucket untouched
    #[tokio::test]
    async fn test_rejection_does_not_deduct() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(store, shared(&clock), config(5, 1, 1_000));

        bucket.consume("user", 3).await.unwrap();
        let denied = bucket.consume("user", 3).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 2);

        assert!(bucket.consume("user", 2).await.unwrap().allowed);
    }

    /// More tokens than the bucket holds can never be granted, so no wait is advertised
    #[tokio::test]
    async fn test_cost_above_capacity_has_no_retry_after() {
        let (store, clock) = memory_store_with_clock();
        let bucket = TokenBucket::new(Arc::clone(&store), shared(&clock), config(5, 1, 1_000));

        let err = bucket.consume("user", 6).await.unwrap_err();
        assert!(matches!(err, RateLimiterError::Algorithm(ref msg) if msg.contains("exceeds limit 5")));
        assert_eq!(store.get_bucket("tb:user").await.unwrap(), None);

        assert!(bucket.consume("user", 5).await.unwrap().allowed);
    }

    /// Bucket state is persisted with a TTL long enough to refill completely
    #[tokio::test]
    async fn test_state_expires_once_full_again() {
        let (store, clock) = memory_store_with_clock();
        let cfg = config(4, 1, 1_000);
        let bucket = TokenBucket::new(Arc::clone(&store), shared(&clock), cfg);

        bucket.consume("user", 4).await.unwrap();
        assert!(store.get_bucket("tb:user").await.unwrap().is_some());

        clock.advance(BucketState::ttl(&cfg));
        assert_eq!(store.get_bucket("tb:user").await.unwrap(), None);

        // a missing bucket is a full one
        assert_eq!(bucket.check("user").await.unwrap().remaining, 4);
    }

    /// Test concurrent access to the rate limiter
    #[tokio::test]
    async fn test_concurrent_access() {
        let (store, clock) = memory_store_with_clock();
        let bucket = Arc::new(TokenBucket::new(store, shared(&clock), config(10, 1, 60_000)));

        let handles = (0..50).map(|_| {
            let bucket = Arc::clone(&bucket);
            tokio::spawn(async move { bucket.consume("concurrent_user", 1).await.unwrap().allowed })
        });

        let admitted = join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(admitted, 10, "exactly capacity requests should pass");
    }

    #[test]
    fn test_bucket_state_arithmetic() {
        let cfg = config(10, 3, 100);
        let mut state = BucketState {
            tokens: 1.0,
            last_refill_ms: 1_000,
        };

        state.refill(&cfg, 1_250);
        assert_eq!(state.tokens, 7.0);
        assert_eq!(state.last_refill_ms, 1_200);

        assert!(!state.try_take(8));
        assert!(state.try_take(7));
        assert_eq!(state.tokens, 0.0);

        assert_eq!(state.intervals_until(&cfg, 10.0), 4);
        assert_eq!(state.full_at_ms(&cfg), 1_600);
        assert_eq!(BucketState::ttl(&cfg), Duration::from_millis(500));
    }
}
