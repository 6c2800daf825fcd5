//! Store traits for abstracting local and distributed bucket state.

use async_trait::async_trait;

use super::bucket::{BucketState, Transition};
use super::rules::RateLimitConfig;
use crate::error::Result;

/// Holder of per-key bucket state.
///
/// Implementations own the atomicity contract: `apply_transition` must read
/// the current state, run [`transition`](super::bucket::transition) and write
/// the result as one indivisible step with respect to every other caller on
/// the same key.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Read the state for `key` without mutating it.
    ///
    /// May be stale under concurrent writers; never use it to gate admission.
    async fn peek(&self, key: &str) -> Result<Option<BucketState>>;

    /// Atomically apply a request of `weight` tokens at `now`.
    async fn apply_transition(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition>;
}

/// Same contract as [`BucketStore`], executed on the caller's thread.
pub trait BlockingBucketStore: Send + Sync {
    /// Read the state for `key` without mutating it.
    fn peek_blocking(&self, key: &str) -> Result<Option<BucketState>>;

    /// Atomically apply a request of `weight` tokens at `now`.
    fn apply_transition_blocking(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition>;
}

#[async_trait]
impl<S: BucketStore + ?Sized> BucketStore for std::sync::Arc<S> {
    async fn peek(&self, key: &str) -> Result<Option<BucketState>> {
        (**self).peek(key).await
    }

    async fn apply_transition(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition> {
        (**self).apply_transition(key, weight, now, config).await
    }
}

impl<S: BlockingBucketStore + ?Sized> BlockingBucketStore for std::sync::Arc<S> {
    fn peek_blocking(&self, key: &str) -> Result<Option<BucketState>> {
        (**self).peek_blocking(key)
    }

    fn apply_transition_blocking(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition> {
        (**self).apply_transition_blocking(key, weight, now, config)
    }
}
