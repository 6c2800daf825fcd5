//! In-process bucket store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::bucket::{transition, BucketState, Transition};
use super::rules::RateLimitConfig;
use super::store::{BlockingBucketStore, BucketStore};
use crate::clock::Clock;
use crate::error::{Result, TollgateError};

/// Bucket state held in a sharded in-memory map.
///
/// Each transition holds the write lock of the one shard owning its key, and
/// only for the refill and charge arithmetic. Keys on other shards are never
/// blocked by it.
///
/// Entries are never expired implicitly. Long-running processes should call
/// [`evict_idle`](Self::evict_idle) or run [`spawn_sweeper`](Self::spawn_sweeper)
/// to keep the map bounded.
#[derive(Debug, Default)]
pub struct LocalStore {
    buckets: DashMap<String, BucketState>,
}

impl LocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with `shards` lock shards (a power of two).
    pub fn with_shard_amount(shards: usize) -> Self {
        Self {
            buckets: DashMap::with_shard_amount(shards),
        }
    }

    fn apply(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition> {
        if let Some(mut state) = self.buckets.get_mut(key) {
            let result = transition(Some(&*state), weight, now, config)?;
            *state = result.state;
            return Ok(result);
        }

        // Another caller may have inserted the key since the miss above.
        let result = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let result = transition(Some(occupied.get()), weight, now, config)?;
                *occupied.get_mut() = result.state;
                result
            }
            Entry::Vacant(vacant) => {
                let result = transition(None, weight, now, config)?;
                vacant.insert(result.state);
                result
            }
        };
        Ok(result)
    }

    /// Drop buckets whose last transition is more than `max_idle` before `now`.
    ///
    /// A dropped key starts over as a full bucket, so `max_idle` should be at
    /// least `capacity / refill_rate` for eviction to be invisible to callers.
    /// Returns the number of buckets removed.
    pub fn evict_idle(&self, now: f64, max_idle: Duration) -> usize {
        let max_idle = max_idle.as_secs_f64();
        let mut evicted = 0;
        self.buckets.retain(|_, state| {
            let keep = now - state.last_refill <= max_idle;
            if !keep {
                evicted += 1;
            }
            keep
        });
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` on the tokio runtime.
    ///
    /// The task ends on its own once the store is dropped. Both durations must
    /// be non-zero; see [`validate_max_idle`] for a lower bound on `max_idle`.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_idle: Duration,
    ) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(TollgateError::InvalidConfig(
                "sweep interval must be positive".to_string(),
            ));
        }
        if max_idle.is_zero() {
            return Err(TollgateError::InvalidConfig(
                "max_idle must be positive".to_string(),
            ));
        }

        let store = Arc::downgrade(self);
        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let evicted = store.evict_idle(clock.now_secs(), max_idle);
                if evicted > 0 {
                    debug!(evicted, remaining = store.len(), "Evicted idle buckets");
                }
            }
        }))
    }

    /// Number of keys with state.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key has state.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Forget every bucket.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

/// Check that evicting buckets idle for `max_idle` never hands out tokens.
///
/// An evicted key comes back full, so only buckets that would have refilled
/// completely may be dropped: `max_idle` must cover `capacity / refill_rate`.
/// With a zero refill rate no bucket ever refills and eviction is rejected.
pub fn validate_max_idle(max_idle: Duration, config: &RateLimitConfig) -> Result<()> {
    if max_idle.is_zero() {
        return Err(TollgateError::InvalidConfig(
            "max_idle must be positive".to_string(),
        ));
    }
    if config.refill_rate() == 0.0 {
        return Err(TollgateError::InvalidConfig(
            "idle eviction requires a positive refill_rate".to_string(),
        ));
    }

    let full_refill = config.capacity() / config.refill_rate();
    if max_idle.as_secs_f64() < full_refill {
        return Err(TollgateError::InvalidConfig(format!(
            "max_idle of {}s is shorter than the {}s a drained bucket needs to refill",
            max_idle.as_secs_f64(),
            full_refill
        )));
    }
    Ok(())
}

impl BlockingBucketStore for LocalStore {
    fn peek_blocking(&self, key: &str) -> Result<Option<BucketState>> {
        Ok(self.buckets.get(key).map(|state| *state))
    }

    fn apply_transition_blocking(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition> {
        let result = self.apply(key, weight, now, config)?;
        trace!(
            key = %key,
            weight,
            admitted = result.admitted,
            tokens = result.state.tokens,
            "Applied local transition"
        );
        Ok(result)
    }
}

#[async_trait]
impl BucketStore for LocalStore {
    async fn peek(&self, key: &str) -> Result<Option<BucketState>> {
        self.peek_blocking(key)
    }

    async fn apply_transition(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition> {
        self.apply_transition_blocking(key, weight, now, config)
    }
}
