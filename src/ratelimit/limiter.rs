//! Admission decisions over a bucket store.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace};

use super::bucket::{project, Transition};
use super::headers::RateLimitHeaders;
use super::rules::{validate_weight, RateLimitConfig};
use super::store::{BlockingBucketStore, BucketStore};
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Verdict and metadata for one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Metadata to attach to the caller's response
    pub headers: RateLimitHeaders,
}

/// Token-bucket limiter over a store `S`.
///
/// The limiter is an ordinary value: build one per bucket configuration and
/// hand it (usually inside an `Arc`) to whatever serves requests. With an
/// async store use [`allow`](Self::allow) and friends; with a blocking store
/// the `_blocking` methods run entirely on the caller's thread. Both flavors
/// share the same transition and projection code.
#[derive(Debug)]
pub struct Limiter<S> {
    config: RateLimitConfig,
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> Limiter<S> {
    /// Create a limiter using the system clock.
    pub fn new(config: RateLimitConfig, store: S) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock, e.g. with a [`ManualClock`](crate::clock::ManualClock) in tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bucket parameters.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    fn decide(&self, key: &str, weight: f64, result: Transition) -> Decision {
        let headers = RateLimitHeaders::from_tokens(result.state.tokens, &self.config);
        if result.admitted {
            trace!(key = %key, weight, remaining = headers.remaining, "Request admitted");
            Decision {
                admitted: true,
                headers,
            }
        } else {
            debug!(key = %key, weight, remaining = headers.remaining, "Rate limit exceeded");
            Decision {
                admitted: false,
                headers: headers.denied(),
            }
        }
    }
}

impl<S: BucketStore> Limiter<S> {
    /// Try to admit a request of the default weight.
    pub async fn allow(&self, key: &str) -> Result<bool> {
        self.allow_weighted(key, self.config.default_weight()).await
    }

    /// Try to admit a request costing `weight` tokens.
    pub async fn allow_weighted(&self, key: &str, weight: f64) -> Result<bool> {
        Ok(self.check(key, weight).await?.admitted)
    }

    /// Try to admit a request and report metadata from the resulting state.
    pub async fn check(&self, key: &str, weight: f64) -> Result<Decision> {
        validate_weight(weight)?;
        let now = self.clock.now_secs();
        let result = self
            .store
            .apply_transition(key, weight, now, &self.config)
            .await?;
        Ok(self.decide(key, weight, result))
    }

    /// Tokens the key would have right now, without spending any.
    ///
    /// For display only; admission always goes through the store's atomic
    /// transition.
    pub async fn remaining(&self, key: &str) -> Result<f64> {
        let snapshot = self.store.peek(key).await?;
        Ok(project(snapshot.as_ref(), self.clock.now_secs(), &self.config))
    }

    /// Quota metadata for the key, without spending any tokens.
    pub async fn headers(&self, key: &str) -> Result<RateLimitHeaders> {
        let snapshot = self.store.peek(key).await?;
        Ok(RateLimitHeaders::project(
            snapshot.as_ref(),
            &self.config,
            self.clock.now_secs(),
        ))
    }
}

impl<S: BlockingBucketStore> Limiter<S> {
    /// Blocking form of [`allow`](Self::allow).
    pub fn allow_blocking(&self, key: &str) -> Result<bool> {
        self.allow_weighted_blocking(key, self.config.default_weight())
    }

    /// Blocking form of [`allow_weighted`](Self::allow_weighted).
    pub fn allow_weighted_blocking(&self, key: &str, weight: f64) -> Result<bool> {
        Ok(self.check_blocking(key, weight)?.admitted)
    }

    /// Blocking form of [`check`](Self::check).
    pub fn check_blocking(&self, key: &str, weight: f64) -> Result<Decision> {
        validate_weight(weight)?;
        let now = self.clock.now_secs();
        let result = self
            .store
            .apply_transition_blocking(key, weight, now, &self.config)?;
        Ok(self.decide(key, weight, result))
    }

    /// Blocking form of [`remaining`](Self::remaining).
    pub fn remaining_blocking(&self, key: &str) -> Result<f64> {
        let snapshot = self.store.peek_blocking(key)?;
        Ok(project(snapshot.as_ref(), self.clock.now_secs(), &self.config))
    }

    /// Blocking form of [`headers`](Self::headers).
    pub fn headers_blocking(&self, key: &str) -> Result<RateLimitHeaders> {
        let snapshot = self.store.peek_blocking(key)?;
        Ok(RateLimitHeaders::project(
            snapshot.as_ref(),
            &self.config,
            self.clock.now_secs(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TollgateError;
    use crate::ratelimit::bucket::BucketState;
    use crate::ratelimit::LocalStore;
    use async_trait::async_trait;
    use std::time::Duration;

    const KEY: &str = "test_user";

    fn limiter_at(start: f64) -> (Limiter<LocalStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let config = RateLimitConfig::new(5.0, 1.0).unwrap();
        let limiter = Limiter::new(config, LocalStore::new()).with_clock(clock.clone());
        (limiter, clock)
    }

    /// A store whose backend is always down.
    struct DownStore;

    #[async_trait]
    impl BucketStore for DownStore {
        async fn peek(&self, _key: &str) -> Result<Option<BucketState>> {
            Err(TollgateError::StoreUnavailable("connection refused".into()))
        }

        async fn apply_transition(
            &self,
            _key: &str,
            _weight: f64,
            _now: f64,
            _config: &RateLimitConfig,
        ) -> Result<Transition> {
            Err(TollgateError::StoreUnavailable("connection refused".into()))
        }
    }

    #[test]
    fn test_initial_allow() {
        let (limiter, _clock) = limiter_at(1_000.0);

        for _ in 0..5 {
            assert!(limiter.allow_blocking(KEY).unwrap());
        }
        assert!(!limiter.allow_blocking(KEY).unwrap());
    }

    #[test]
    fn test_refill_after_wait() {
        let (limiter, clock) = limiter_at(1_000.0);
        for _ in 0..5 {
            limiter.allow_blocking(KEY).unwrap();
        }
        assert!(!limiter.allow_blocking(KEY).unwrap());

        clock.advance(Duration::from_millis(1100));
        assert!(limiter.allow_blocking(KEY).unwrap());
        assert!(!limiter.allow_blocking(KEY).unwrap());
    }

    #[test]
    fn test_token_recovery_is_capped() {
        let (limiter, clock) = limiter_at(1_000.0);
        for _ in 0..5 {
            limiter.allow_blocking(KEY).unwrap();
        }

        clock.advance(Duration::from_secs(10));
        for _ in 0..5 {
            assert!(limiter.allow_blocking(KEY).unwrap());
        }
        assert!(!limiter.allow_blocking(KEY).unwrap());
    }

    #[test]
    fn test_headers_for_fresh_key() {
        let (limiter, _clock) = limiter_at(1_000.0);
        let headers = limiter.headers_blocking(KEY).unwrap();

        assert_eq!(headers.limit, 5.0);
        assert_eq!(headers.remaining, 5.0);
        assert_eq!(headers.reset, 0.0);
        assert_eq!(headers.retry_after, None);
    }

    #[test]
    fn test_remaining_after_spend() {
        let (limiter, _clock) = limiter_at(1_000.0);
        assert_eq!(limiter.remaining_blocking(KEY).unwrap(), 5.0);

        limiter.allow_blocking(KEY).unwrap();
        assert_eq!(limiter.remaining_blocking(KEY).unwrap(), 4.0);

        let headers = limiter.headers_blocking(KEY).unwrap();
        assert_eq!(headers.remaining, 4.0);
        assert_eq!(headers.reset, 1.0);
    }

    #[test]
    fn test_projection_never_mutates() {
        let (limiter, clock) = limiter_at(1_000.0);
        limiter.allow_weighted_blocking(KEY, 4.0).unwrap();
        let stored = limiter.store().peek_blocking(KEY).unwrap();

        let mut last = 0.0;
        for _ in 0..5 {
            let remaining = limiter.remaining_blocking(KEY).unwrap();
            assert!(remaining >= last);
            last = remaining;
            clock.advance(Duration::from_millis(250));
        }

        assert_eq!(limiter.store().peek_blocking(KEY).unwrap(), stored);
    }

    #[test]
    fn test_weighted_requests() {
        let (limiter, _clock) = limiter_at(1_000.0);

        assert!(limiter.allow_weighted_blocking(KEY, 3.0).unwrap());
        assert!(!limiter.allow_weighted_blocking(KEY, 3.0).unwrap());
        assert!(limiter.allow_weighted_blocking(KEY, 2.0).unwrap());
    }

    #[test]
    fn test_refill_accuracy_from_empty() {
        let (limiter, clock) = limiter_at(1_000.0);
        limiter.allow_weighted_blocking(KEY, 5.0).unwrap();

        clock.advance(Duration::from_millis(2500));
        assert!(!limiter.allow_weighted_blocking(KEY, 3.0).unwrap());

        clock.advance(Duration::from_millis(500));
        assert!(limiter.allow_weighted_blocking(KEY, 3.0).unwrap());
    }

    #[test]
    fn test_default_weight_from_config() {
        let clock = Arc::new(ManualClock::new(0.0));
        let config = RateLimitConfig::with_default_weight(5.0, 0.0, 2.5).unwrap();
        let limiter = Limiter::new(config, LocalStore::new()).with_clock(clock);

        assert!(limiter.allow_blocking(KEY).unwrap());
        assert!(limiter.allow_blocking(KEY).unwrap());
        assert!(!limiter.allow_blocking(KEY).unwrap());
    }

    #[test]
    fn test_invalid_weight_is_an_error() {
        let (limiter, _clock) = limiter_at(1_000.0);
        let err = limiter.allow_weighted_blocking(KEY, 0.0).unwrap_err();
        assert!(matches!(err, TollgateError::InvalidConfig(_)));
    }

    #[test]
    fn test_check_reports_resulting_state() {
        let (limiter, _clock) = limiter_at(1_000.0);

        let decision = limiter.check_blocking(KEY, 2.0).unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.headers.remaining, 3.0);
        assert_eq!(decision.headers.retry_after, None);

        let decision = limiter.check_blocking(KEY, 4.0).unwrap();
        assert!(!decision.admitted);
        assert_eq!(decision.headers.remaining, 3.0);
        assert_eq!(decision.headers.retry_after, Some(1));
    }

    #[test]
    fn test_refill_against_real_time() {
        let config = RateLimitConfig::new(5.0, 1.0).unwrap();
        let limiter = Limiter::new(config, LocalStore::new());

        for _ in 0..5 {
            assert!(limiter.allow_blocking(KEY).unwrap());
        }
        assert!(!limiter.allow_blocking(KEY).unwrap());

        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.allow_blocking(KEY).unwrap());
        assert!(!limiter.allow_blocking(KEY).unwrap());
    }

    #[tokio::test]
    async fn test_async_flavor_matches_blocking() {
        let (limiter, clock) = limiter_at(1_000.0);

        for _ in 0..5 {
            assert!(limiter.allow(KEY).await.unwrap());
        }
        assert!(!limiter.allow(KEY).await.unwrap());
        assert_eq!(limiter.remaining(KEY).await.unwrap(), 0.0);

        clock.advance(Duration::from_secs(2));
        let headers = limiter.headers(KEY).await.unwrap();
        assert_eq!(headers.remaining, 2.0);
        assert_eq!(headers.reset, 3.0);
        assert_eq!(limiter.remaining_blocking(KEY).unwrap(), 2.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_no_double_spend_across_tasks() {
        let config = RateLimitConfig::new(10.0, 0.0).unwrap();
        let limiter = Arc::new(Limiter::new(config, LocalStore::new()));

        let calls = (0..100).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.allow("shared").await.unwrap() })
        });
        let results = futures::future::join_all(calls).await;
        let admitted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();

        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_fewer_callers_than_capacity_all_admitted() {
        let config = RateLimitConfig::new(10.0, 0.0).unwrap();
        let limiter = Arc::new(Limiter::new(config, LocalStore::new()));

        let handles: Vec<_> = (0..7)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.allow_blocking("shared").unwrap())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 7);
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_verdict() {
        let config = RateLimitConfig::new(5.0, 1.0).unwrap();
        let limiter = Limiter::new(config, DownStore);

        let err = limiter.allow(KEY).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));

        let err = limiter.headers(KEY).await.unwrap_err();
        assert!(matches!(err, TollgateError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_shared_store_between_limiters() {
        let store = Arc::new(LocalStore::new());
        let clock = Arc::new(ManualClock::new(0.0));
        let config = RateLimitConfig::new(3.0, 0.0).unwrap();
        let a = Limiter::new(config, store.clone()).with_clock(clock.clone());
        let b = Limiter::new(config, store.clone()).with_clock(clock);

        assert!(a.allow(KEY).await.unwrap());
        assert!(b.allow(KEY).await.unwrap());
        assert!(a.allow(KEY).await.unwrap());
        assert!(!b.allow(KEY).await.unwrap());
        assert_eq!(store.len(), 1);
    }
}
