// src/storage/tests/mod.rs

mod redis_tests;

// Checks every backend has to pass
pub(crate) mod common {
    use std::time::Duration;

    use crate::algorithms::token_bucket::BucketState;
    use crate::config::TokenBucketConfig;
    use crate::error::Result;
    use crate::storage::CounterStore;

    const LONG: Duration = Duration::from_secs(60);

    pub async fn test_counter_operations<S: CounterStore + ?Sized>(store: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:counter", prefix);

        assert_eq!(store.get(&key).await?, None);

        // incr creates at zero
        assert_eq!(store.incr(&key, 1, LONG).await?, 1);
        assert_eq!(store.incr(&key, 3, LONG).await?, 4);
        assert_eq!(store.get(&key).await?, Some(4));

        store.set(&key, 42, LONG).await?;
        assert_eq!(store.get(&key).await?, Some(42));

        assert!(store.expire(&key, LONG).await?);
        assert!(!store.expire(&format!("{}:missing", prefix), LONG).await?);

        assert!(store.del(&key).await?);
        assert!(!store.del(&key).await?);
        assert_eq!(store.get(&key).await?, None);

        Ok(())
    }

    pub async fn test_sorted_set_operations<S: CounterStore + ?Sized>(
        store: &S,
        prefix: &str,
    ) -> Result<()> {
        let key = format!("{}:zset", prefix);

        store.zadd(&key, 100, "a").await?;
        store.zadd(&key, 200, "b").await?;
        store.zadd(&key, 300, "c").await?;
        store.expire(&key, LONG).await?;

        // bounds are inclusive
        assert_eq!(store.zcount(&key, 100, 300).await?, 3);
        assert_eq!(store.zcount(&key, 101, 300).await?, 2);
        assert_eq!(store.zcount(&key, 0, 99).await?, 0);

        // re-adding a member moves it instead of duplicating it
        store.zadd(&key, 400, "a").await?;
        assert_eq!(store.zcount(&key, 0, 1_000).await?, 3);
        assert_eq!(store.zcount(&key, 400, 400).await?, 1);

        assert_eq!(store.zremrangebyscore(&key, 0, 250).await?, 1);
        assert_eq!(store.zcount(&key, 0, 1_000).await?, 2);

        assert!(store.del(&key).await?);
        assert_eq!(store.zcount(&key, 0, 1_000).await?, 0);

        Ok(())
    }

    pub async fn test_bucket_operations<S: CounterStore + ?Sized>(store: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:bucket", prefix);
        let config = TokenBucketConfig {
            capacity: 3,
            refill_rate: 1,
            refill_interval: Duration::from_secs(1),
        };
        let now = 1_700_000_000_000;

        assert_eq!(store.get_bucket(&key).await?, None);

        let first = store.take_tokens(&key, &config, 2, now).await?;
        assert!(first.allowed);
        assert_eq!(first.state.tokens, 1.0);
        assert_eq!(first.state.last_refill_ms, now);

        let second = store.take_tokens(&key, &config, 2, now + 10).await?;
        assert!(!second.allowed);
        assert_eq!(second.state.tokens, 1.0);

        // one whole interval later a token has been credited
        let third = store.take_tokens(&key, &config, 2, now + 1_500).await?;
        assert!(third.allowed);
        assert_eq!(third.state.tokens, 0.0);
        assert_eq!(third.state.last_refill_ms, now + 1_000);

        let persisted = store.get_bucket(&key).await?;
        assert_eq!(
            persisted,
            Some(BucketState {
                tokens: 0.0,
                last_refill_ms: now + 1_000
            })
        );

        store
            .set_bucket(
                &key,
                BucketState {
                    tokens: 2.5,
                    last_refill_ms: now,
                },
                LONG,
            )
            .await?;
        assert_eq!(store.get_bucket(&key).await?.map(|s| s.tokens), Some(2.5));

        store.del(&key).await?;
        Ok(())
    }

    pub async fn test_window_admission<S: CounterStore + ?Sized>(store: &S, prefix: &str) -> Result<()> {
        let key = format!("{}:window", prefix);
        let now = 1_700_000_000_000;

        let first = store.admit_window(&key, now, 1_000, 3, 2, "p1").await?;
        assert!(first.allowed);
        assert_eq!(first.count, 0);

        let second = store.admit_window(&key, now + 100, 1_000, 3, 2, "p2").await?;
        assert!(!second.allowed);
        assert_eq!(second.count, 2);
        // a rejected call records nothing
        assert_eq!(store.zcount(&key, now, now + 100).await?, 2);

        let third = store.admit_window(&key, now + 100, 1_000, 3, 1, "p3").await?;
        assert!(third.allowed);
        assert_eq!(third.count, 2);

        // entries exactly window old still count, older ones are pruned
        let at_edge = store.admit_window(&key, now + 1_000, 1_000, 3, 1, "p4").await?;
        assert!(!at_edge.allowed);
        assert_eq!(at_edge.count, 3);

        let past_edge = store.admit_window(&key, now + 1_001, 1_000, 3, 1, "p5").await?;
        assert!(past_edge.allowed);
        assert_eq!(past_edge.count, 1);

        store.del(&key).await?;
        Ok(())
    }
}
