// src/bin/gatekeeper_cli.rs

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gatekeeper::algorithms::{self, RateLimitAlgorithm};
use gatekeeper::clock::{Clock, ManualClock, SystemClock};
use gatekeeper::config::{AlgorithmConfig, InMemoryConfig, TokenBucketConfig, WindowConfig};
use gatekeeper::storage::MemoryStore;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "gatekeeper_cli",
    about = "Replays traffic patterns against one rate limiting algorithm on a virtual clock"
)]
struct Opt {
    /// Rate limiting algorithm to use
    #[structopt(short, long, possible_values = &["fixed-window", "sliding-window", "token-bucket"], default_value = "fixed-window")]
    algorithm: String,

    /// Key to use for rate limiting
    #[structopt(short, long, default_value = "user:cli")]
    key: String,

    /// Maximum number of requests per window (bucket capacity for token-bucket)
    #[structopt(short, long, default_value = "10")]
    max_requests: u64,

    /// Window duration in milliseconds
    #[structopt(short, long, default_value = "60000")]
    window_ms: u64,

    /// Tokens added per refill interval (token-bucket)
    #[structopt(long, default_value = "1")]
    refill_rate: u64,

    /// Refill interval in milliseconds (token-bucket)
    #[structopt(long, default_value = "1000")]
    refill_interval_ms: u64,

    /// Traffic pattern
    #[structopt(long, possible_values = &["burst", "steady", "sine-wave", "random", "boundary"], default_value = "burst")]
    simulation: String,

    /// Number of requests to simulate
    #[structopt(short = "n", long, default_value = "20")]
    num_requests: usize,

    /// Virtual time between requests in milliseconds
    #[structopt(short = "t", long, default_value = "100")]
    request_interval_ms: u64,

    /// Start the virtual clock at this epoch millisecond instead of now
    #[structopt(long)]
    start_ms: Option<u64>,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,

    /// Only print the summary
    #[structopt(long)]
    quiet: bool,
}

impl Opt {
    fn algorithm_config(&self) -> Result<AlgorithmConfig, Box<dyn std::error::Error>> {
        let window = WindowConfig::new(self.max_requests, Duration::from_millis(self.window_ms));
        let config = match self.algorithm.as_str() {
            "fixed-window" => AlgorithmConfig::FixedWindow(window),
            "sliding-window" => AlgorithmConfig::SlidingWindow(window),
            "token-bucket" => AlgorithmConfig::TokenBucket(TokenBucketConfig {
                capacity: self.max_requests,
                refill_rate: self.refill_rate,
                refill_interval: Duration::from_millis(self.refill_interval_ms),
            }),
            other => return Err(format!("Unknown algorithm: {}", other).into()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Virtual delay before request `i` of `total`
fn next_gap(opt: &Opt, i: usize, rng: &mut impl Rng) -> Duration {
    let base = opt.request_interval_ms;
    let millis = match opt.simulation.as_str() {
        "burst" => 0,
        "steady" => base,
        "sine-wave" => {
            let phase = (i as f64 * std::f64::consts::PI * 2.0) / (opt.num_requests as f64);
            // between 0.5x and 1.5x the base interval
            (base as f64 * (1.0 + 0.5 * phase.sin())).round() as u64
        }
        "random" => rng.random_range(0..=base.saturating_mul(2)),
        _ => base,
    };
    Duration::from_millis(millis)
}

#[derive(Debug, Default)]
struct Tally {
    allowed: usize,
    denied: usize,
}

async fn send(
    limiter: &dyn RateLimitAlgorithm,
    clock: &ManualClock,
    opt: &Opt,
    label: &str,
    tally: &mut Tally,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = limiter.consume(&opt.key, 1).await?;
    let at = clock.now_ms();

    if status.allowed {
        tally.allowed += 1;
        if !opt.quiet {
            info!(
                "{} t={}: ALLOWED (remaining: {}, resets in {:?})",
                label,
                at,
                status.remaining,
                status.reset_after(at)
            );
        }
    } else {
        tally.denied += 1;
        if !opt.quiet {
            warn!(
                "{} t={}: DENIED (retry after: {}s)",
                label,
                at,
                status.retry_after.unwrap_or(0)
            );
        }
    }
    Ok(())
}

/// Straddles a fixed-window boundary: a full window just before it, another just after
async fn simulate_boundary(
    opt: &Opt,
    limiter: &dyn RateLimitAlgorithm,
    clock: &ManualClock,
) -> Result<Tally, Box<dyn std::error::Error>> {
    let window = opt.window_ms;
    let boundary = (clock.now_ms() / window + 1) * window;
    let mut tally = Tally::default();

    clock.set(boundary - 1);
    for i in 0..opt.max_requests {
        send(limiter, clock, opt, &format!("Before #{}", i + 1), &mut tally).await?;
    }

    clock.set(boundary + 1);
    for i in 0..opt.max_requests {
        send(limiter, clock, opt, &format!("After #{}", i + 1), &mut tally).await?;
    }

    Ok(tally)
}

async fn simulate_pattern(
    opt: &Opt,
    limiter: &dyn RateLimitAlgorithm,
    clock: &ManualClock,
) -> Result<Tally, Box<dyn std::error::Error>> {
    let mut rng = rand::rng();
    let mut tally = Tally::default();

    for i in 0..opt.num_requests {
        if i > 0 {
            clock.advance(next_gap(opt, i, &mut rng));
        }
        send(limiter, clock, opt, &format!("Request {}", i + 1), &mut tally).await?;
    }

    Ok(tally)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match (opt.quiet, opt.verbose) {
        (true, _) => "error",
        (false, 0) => "info",
        (false, 1) => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "gatekeeper_cli={},gatekeeper={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match opt.algorithm_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid limiter settings: {}", e);
            return Err(e);
        }
    };

    let clock = ManualClock::new(opt.start_ms.unwrap_or_else(|| SystemClock.now_ms()));
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store = Arc::new(MemoryStore::new(
        InMemoryConfig {
            use_background_task: false,
            ..InMemoryConfig::default()
        },
        shared_clock.clone(),
    ));
    let limiter = algorithms::build(&config, store, shared_clock);

    info!(
        "Running {} simulation with {} (limit {})",
        opt.simulation,
        limiter.name(),
        limiter.limit()
    );

    let started_at = clock.now_ms();
    let tally = match opt.simulation.as_str() {
        "boundary" => simulate_boundary(&opt, limiter.as_ref(), &clock).await?,
        _ => simulate_pattern(&opt, limiter.as_ref(), &clock).await?,
    };
    let virtual_elapsed = Duration::from_millis(clock.now_ms().saturating_sub(started_at));

    println!("\n{} simulation results ({}):", opt.simulation, limiter.name());
    println!("-------------------------------------");
    println!("Total requests: {}", tally.allowed + tally.denied);
    println!("Allowed: {}", tally.allowed);
    println!("Denied: {}", tally.denied);
    println!("Virtual time elapsed: {:?}", virtual_elapsed);

    Ok(())
}
