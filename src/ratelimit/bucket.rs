//! Token bucket state and the pure transition function.
//!
//! Nothing here performs I/O. Stores call [`transition`] inside whatever
//! critical section makes the read-compute-write atomic for one key.

use serde::{Deserialize, Serialize};

use super::rules::{validate_weight, RateLimitConfig};
use crate::error::Result;

/// Persisted state of one bucket.
///
/// A key with no state is a full bucket, not an empty one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens available at `last_refill`, within `[0, capacity]`
    pub tokens: f64,
    /// Seconds since the Unix epoch of the last transition
    pub last_refill: f64,
}

impl BucketState {
    /// A full bucket stamped at `now`.
    pub fn full(config: &RateLimitConfig, now: f64) -> Self {
        Self {
            tokens: config.capacity(),
            last_refill: now,
        }
    }
}

/// Outcome of applying one request to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// Whether the request was admitted
    pub admitted: bool,
    /// State to persist for the key
    pub state: BucketState,
}

/// Token count at `now` after refilling, without charging anything.
pub fn project(state: Option<&BucketState>, now: f64, config: &RateLimitConfig) -> f64 {
    let Some(state) = state else {
        return config.capacity();
    };

    let elapsed = (now - state.last_refill).max(0.0);
    let refilled = state.tokens.max(0.0) + elapsed * config.refill_rate();
    refilled.min(config.capacity())
}

/// Apply a request of `weight` tokens at `now`.
///
/// A denied request is not charged but still advances the refill clock. The
/// stored stamp never moves backwards, so a caller whose clock lags the one
/// that last wrote the key neither gains nor loses tokens.
pub fn transition(
    state: Option<&BucketState>,
    weight: f64,
    now: f64,
    config: &RateLimitConfig,
) -> Result<Transition> {
    validate_weight(weight)?;

    let current = state.copied().unwrap_or_else(|| BucketState::full(config, now));
    let refilled = project(Some(&current), now, config);

    let (admitted, tokens) = if refilled >= weight {
        (true, refilled - weight)
    } else {
        (false, refilled)
    };

    Ok(Transition {
        admitted,
        state: BucketState {
            tokens,
            last_refill: current.last_refill.max(now),
        },
    })
}
