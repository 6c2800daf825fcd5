//! Token-bucket admission and bucket state management.

mod bucket;
mod headers;
mod key;
mod limiter;
mod local;
mod policy;
mod remote;
mod rules;
mod store;

pub use bucket::{project, transition, BucketState, Transition};
pub use headers::{
    RateLimitHeaders, DEFAULT_RETRY_AFTER_SECS, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER,
    RETRY_AFTER_HEADER,
};
pub use key::{BucketKey, DEFAULT_KEY_PREFIX};
pub use limiter::{Decision, Limiter};
pub use local::{validate_max_idle, LocalStore};
pub use policy::FailurePolicy;
pub use remote::{RedisStore, RedisStoreOptions, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT, DEFAULT_TTL};
pub use rules::{validate_weight, RateLimitConfig, DEFAULT_WEIGHT};
pub use store::{BlockingBucketStore, BucketStore};
