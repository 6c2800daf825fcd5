//! Quota metadata exposed to callers.
//!
//! Projections are computed from a state snapshot and never write back, so
//! they can be taken as often as needed without affecting admission.

use serde::{Deserialize, Serialize};

use super::bucket::{project, BucketState};
use super::rules::RateLimitConfig;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER_HEADER: &str = "Retry-After";

/// Retry hint attached to denials, in seconds.
///
/// Deliberately coarse: it does not depend on the actual token deficit.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Metadata describing a bucket at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitHeaders {
    /// Bucket capacity
    pub limit: f64,
    /// Tokens available, rounded to two decimals
    pub remaining: f64,
    /// Seconds until the bucket is full again, rounded to two decimals
    pub reset: f64,
    /// Present only on denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitHeaders {
    /// Project metadata for `snapshot` as of `now`.
    pub fn project(snapshot: Option<&BucketState>, config: &RateLimitConfig, now: f64) -> Self {
        Self::from_tokens(project(snapshot, now, config), config)
    }

    /// Build metadata from an already projected token count.
    pub fn from_tokens(tokens: f64, config: &RateLimitConfig) -> Self {
        let tokens = tokens.clamp(0.0, config.capacity());
        let reset = if config.refill_rate() > 0.0 {
            (config.capacity() - tokens) / config.refill_rate()
        } else {
            0.0
        };

        Self {
            limit: config.capacity(),
            remaining: round2(tokens),
            reset: round2(reset.max(0.0)),
            retry_after: None,
        }
    }

    /// Mark these headers as belonging to a denied request.
    pub fn denied(mut self) -> Self {
        self.retry_after = Some(DEFAULT_RETRY_AFTER_SECS);
        self
    }

    /// Render as header name/value pairs.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            (LIMIT_HEADER, self.limit.to_string()),
            (REMAINING_HEADER, self.remaining.to_string()),
            (RESET_HEADER, self.reset.to_string()),
        ];
        if let Some(retry_after) = self.retry_after {
            pairs.push((RETRY_AFTER_HEADER, retry_after.to_string()));
        }
        pairs
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
