//! Tollgate - token-bucket request admission
//!
//! This crate decides whether a request identified by a key may proceed,
//! charging it a weight against a continuously refilling token bucket. Bucket
//! state lives in a [`BucketStore`](ratelimit::BucketStore): in process with
//! [`LocalStore`](ratelimit::LocalStore), or shared between instances through
//! Redis with [`RedisStore`](ratelimit::RedisStore).
//!
//! ```
//! use tollgate::ratelimit::{Limiter, LocalStore, RateLimitConfig};
//!
//! let config = RateLimitConfig::new(5.0, 1.0).unwrap();
//! let limiter = Limiter::new(config, LocalStore::new());
//!
//! assert!(limiter.allow_blocking("10.0.0.1").unwrap());
//! let headers = limiter.headers_blocking("10.0.0.1").unwrap();
//! assert!(headers.remaining < 5.0);
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
