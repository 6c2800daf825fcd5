//! Redis-backed bucket store shared by every process pointing at one server.
//!
//! Each transition runs as a single Lua script on the server, so the read of
//! the current state, the refill arithmetic and the write happen as one step
//! no matter how many instances hit the same key.

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::{Client, RedisError, Script};
use tracing::{debug, info, trace, warn};

use super::bucket::{BucketState, Transition};
use super::key::{BucketKey, DEFAULT_KEY_PREFIX};
use super::rules::{validate_weight, RateLimitConfig};
use super::store::BucketStore;
use crate::error::{Result, TollgateError};

/// Idle time after which a remote bucket expires and reverts to full.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
/// Upper bound for any single remote call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
/// Retries after a busy reply before reporting contention.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

const RETRY_BACKOFF_MS: u64 = 5;

// Mirrors bucket::transition. ARGV: capacity, refill_rate, weight, now, ttl_secs.
// Replies {admitted, tokens, last_refill}; floats go back as strings because
// Lua numbers are truncated to integers in replies.
const TRANSITION_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local weight = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local fields = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(fields[1])
local last_refill = tonumber(fields[2])
if tokens == nil or last_refill == nil then
  tokens = capacity
  last_refill = now
end

local elapsed = math.max(0, now - last_refill)
local refilled = math.min(capacity, math.max(0, tokens) + elapsed * refill_rate)
local admitted = 0
if refilled >= weight then
  refilled = refilled - weight
  admitted = 1
end
local stamp = math.max(last_refill, now)

local encoded_tokens = string.format('%.17g', refilled)
local encoded_stamp = string.format('%.17g', stamp)
redis.call('HSET', KEYS[1], 'tokens', encoded_tokens, 'last_refill', encoded_stamp)
redis.call('EXPIRE', KEYS[1], ttl)
return {admitted, encoded_tokens, encoded_stamp}
"#;

// Invoked by SHA; the body is only sent again after the server reports NOSCRIPT.
static TRANSITION: LazyLock<Script> = LazyLock::new(|| Script::new(TRANSITION_SCRIPT));

/// Tunables for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreOptions {
    /// Namespace for every key written by this store
    pub key_prefix: String,
    /// Expiry refreshed on every write
    pub ttl: Duration,
    /// Bound on connecting and on each command
    pub timeout: Duration,
    /// Retries after a busy reply
    pub max_retries: u32,
}

impl Default for RedisStoreOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Bucket store backed by a Redis-compatible server.
///
/// `ConnectionManager` reconnects on its own and multiplexes commands, so one
/// store can be cloned freely across tasks.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    options: RedisStoreOptions,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("options", &self.options)
            .finish()
    }
}

impl RedisStore {
    /// Connect to `url` and verify the server answers.
    ///
    /// The whole handshake is bounded by `options.timeout`.
    pub async fn connect(url: &str, options: RedisStoreOptions) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| unavailable(format!("Failed to create Redis client: {}", e)))?;

        let connect = async {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, RedisError>(connection)
        };

        let connection = with_timeout(options.timeout, connect)
            .await
            .map_err(|e| unavailable(format!("Failed to connect to Redis: {}", e)))?;

        info!(
            key_prefix = %options.key_prefix,
            ttl_secs = options.ttl.as_secs(),
            "Connected to Redis bucket store"
        );

        Ok(Self {
            connection,
            options,
        })
    }

    fn store_key(&self, key: &str) -> String {
        BucketKey::new(&self.options.key_prefix, key).to_store_key()
    }
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn peek(&self, key: &str) -> Result<Option<BucketState>> {
        let store_key = self.store_key(key);
        let mut conn = self.connection.clone();

        with_timeout(self.options.timeout, execute_peek(&mut conn, &store_key))
            .await
            .map_err(|e| unavailable(format!("Failed to read {}: {}", store_key, e)))
    }

    async fn apply_transition(
        &self,
        key: &str,
        weight: f64,
        now: f64,
        config: &RateLimitConfig,
    ) -> Result<Transition> {
        validate_weight(weight)?;

        let store_key = self.store_key(key);
        let ttl_secs = self.options.ttl.as_secs().max(1);
        let mut attempt = 0;

        loop {
            let mut conn = self.connection.clone();
            let call = execute_transition(&mut conn, &store_key, weight, now, ttl_secs, config);

            match with_timeout(self.options.timeout, call).await {
                Ok(result) => {
                    trace!(
                        key = %store_key,
                        weight,
                        admitted = result.admitted,
                        tokens = result.state.tokens,
                        "Applied remote transition"
                    );
                    return Ok(result);
                }
                Err(CallError::Redis(e)) if is_busy(&e) => {
                    attempt += 1;
                    if attempt > self.options.max_retries {
                        warn!(key = %store_key, attempts = attempt, "Giving up on busy Redis key");
                        return Err(TollgateError::Contention {
                            key: store_key,
                            attempts: attempt,
                        });
                    }
                    let backoff = retry_backoff(attempt);
                    debug!(
                        key = %store_key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Redis busy, retrying transition"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(unavailable(format!(
                        "Failed to apply transition on {}: {}",
                        store_key, e
                    )));
                }
            }
        }
    }
}

/// Run the transition script against any async Redis-compatible connection.
async fn execute_transition<C: ConnectionLike>(
    conn: &mut C,
    store_key: &str,
    weight: f64,
    now: f64,
    ttl_secs: u64,
    config: &RateLimitConfig,
) -> std::result::Result<Transition, RedisError> {
    let (admitted, tokens, last_refill): (i64, f64, f64) = TRANSITION
        .key(store_key)
        .arg(config.capacity())
        .arg(config.refill_rate())
        .arg(weight)
        .arg(now)
        .arg(ttl_secs)
        .invoke_async(conn)
        .await?;

    Ok(Transition {
        admitted: admitted == 1,
        state: BucketState {
            tokens: tokens.clamp(0.0, config.capacity()),
            last_refill,
        },
    })
}

/// Read both hash fields; a missing field means the key is absent.
async fn execute_peek<C: ConnectionLike>(
    conn: &mut C,
    store_key: &str,
) -> std::result::Result<Option<BucketState>, RedisError> {
    let (tokens, last_refill): (Option<f64>, Option<f64>) = redis::cmd("HMGET")
        .arg(store_key)
        .arg("tokens")
        .arg("last_refill")
        .query_async(conn)
        .await?;

    Ok(match (tokens, last_refill) {
        (Some(tokens), Some(last_refill)) => Some(BucketState {
            tokens,
            last_refill,
        }),
        _ => None,
    })
}

#[derive(Debug)]
enum CallError {
    Redis(RedisError),
    Timeout(Duration),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallError::Redis(e) => write!(f, "{}", e),
            CallError::Timeout(limit) => write!(f, "timed out after {}ms", limit.as_millis()),
        }
    }
}

async fn with_timeout<T, F>(limit: Duration, call: F) -> std::result::Result<T, CallError>
where
    F: Future<Output = std::result::Result<T, RedisError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Redis(e)),
        Err(_) => Err(CallError::Timeout(limit)),
    }
}

fn is_busy(err: &RedisError) -> bool {
    matches!(err.code(), Some("BUSY") | Some("TRYAGAIN"))
}

fn retry_backoff(attempt: u32) -> Duration {
    let base = RETRY_BACKOFF_MS * u64::from(attempt);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_BACKOFF_MS);
    Duration::from_millis(base + jitter)
}

fn unavailable(message: String) -> TollgateError {
    TollgateError::StoreUnavailable(message)
}
