use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::clock::SystemClock;
use tollgate::config::{Backend, LoggingConfig, TollgateConfig};
use tollgate::ratelimit::{BucketStore, FailurePolicy, Limiter, LocalStore, RedisStore};

/// Token-bucket admission checks against a local or Redis-backed store
#[derive(Debug, Parser)]
#[command(name = "tollgate", version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bucket store (local, redis)
    #[arg(long)]
    backend: Option<Backend>,

    /// Redis connection URL
    #[arg(long)]
    redis_url: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spend tokens for KEY and print each verdict
    Check {
        key: String,
        /// Cost of each request (defaults to the bucket's default weight)
        #[arg(short, long)]
        weight: Option<f64>,
        /// Number of consecutive requests
        #[arg(short = 'n', long, default_value_t = 1)]
        repeat: u32,
    },
    /// Print quota metadata for KEY without spending tokens
    Status { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config =
        TollgateConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(backend) = cli.backend {
        config.store.backend = backend;
    }
    if let Some(url) = cli.redis_url.clone() {
        config.store.redis_url = url;
    }
    if let Some(level) = cli.log_level.clone() {
        config.logging.level = level;
    }

    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.store.backend,
        capacity = config.bucket.capacity(),
        refill_rate = config.bucket.refill_rate(),
        "Starting tollgate"
    );

    // The backend is chosen once here; everything after runs against one
    // concrete store type.
    match config.store.backend {
        Backend::Local => run(local_limiter(&config)?, &cli.command, config.failure_policy).await,
        Backend::Redis => {
            match RedisStore::connect(&config.store.redis_url, config.store.redis_options()).await {
                Ok(store) => {
                    let limiter = Limiter::new(config.bucket, store);
                    run(limiter, &cli.command, config.failure_policy).await
                }
                Err(e) if config.store.fallback_to_local => {
                    warn!(error = %e, "Redis unavailable, falling back to local store");
                    run(local_limiter(&config)?, &cli.command, config.failure_policy).await
                }
                Err(e) => Err(e).context("Redis store unavailable"),
            }
        }
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Verdicts go to stdout; keep logs out of the way.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn local_limiter(config: &TollgateConfig) -> anyhow::Result<Limiter<Arc<LocalStore>>> {
    let store = Arc::new(LocalStore::new());

    if let Some(max_idle) = config.store.local_max_idle() {
        store
            .spawn_sweeper(Arc::new(SystemClock), max_idle, max_idle)
            .context("Failed to start local bucket eviction")?;
        info!(
            max_idle_secs = max_idle.as_secs(),
            "Local bucket eviction enabled"
        );
    }

    Ok(Limiter::new(config.bucket, store))
}

async fn run<S: BucketStore>(
    limiter: Limiter<S>,
    command: &Command,
    policy: FailurePolicy,
) -> anyhow::Result<()> {
    match command {
        Command::Check {
            key,
            weight,
            repeat,
        } => {
            let weight = weight.unwrap_or(limiter.config().default_weight());
            for attempt in 1..=*repeat {
                let line = match limiter.check(key, weight).await {
                    Ok(decision) => json!({
                        "key": key,
                        "attempt": attempt,
                        "admitted": decision.admitted,
                        "headers": header_map(&decision.headers.to_pairs()),
                    }),
                    Err(e) => {
                        let admitted = policy.resolve(Err(e))?;
                        json!({
                            "key": key,
                            "attempt": attempt,
                            "admitted": admitted,
                            "degraded": true,
                        })
                    }
                };
                println!("{}", line);
            }
        }
        Command::Status { key } => {
            let headers = limiter.headers(key).await?;
            let line = json!({
                "key": key,
                "headers": header_map(&headers.to_pairs()),
            });
            println!("{}", line);
        }
    }

    Ok(())
}

fn header_map(pairs: &[(&'static str, String)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), Value::String(value.clone())))
        .collect()
}
