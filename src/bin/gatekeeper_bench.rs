// src/bin/gatekeeper_bench.rs

use indicatif::{ProgressBar, ProgressStyle};
use prettytable::{Cell, Row, Table};
use std::sync::Arc;
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::sync::{Barrier, Semaphore};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gatekeeper::algorithms::{self, RateLimitAlgorithm};
use gatekeeper::clock::{self, Clock};
use gatekeeper::config::{
    AlgorithmConfig, InMemoryConfig, RedisConfig, StoreSettings, TokenBucketConfig, WindowConfig,
};
use gatekeeper::storage::{self, CounterStore};

#[derive(Debug, Clone, StructOpt)]
#[structopt(
    name = "gatekeeper_bench",
    about = "Concurrent load benchmark that checks admitted requests against the limit"
)]
struct Opt {
    /// Rate limiting algorithm to benchmark
    #[structopt(short, long, possible_values = &["fixed-window", "sliding-window", "token-bucket", "all"], default_value = "all")]
    algorithm: String,

    /// Redis URL; the in-process store is used when absent or unreachable
    #[structopt(long)]
    redis_url: Option<String>,

    /// Maximum number of requests allowed per key
    #[structopt(short, long, default_value = "100")]
    max_requests: u64,

    /// Window duration in seconds
    #[structopt(short, long, default_value = "60")]
    window_seconds: u64,

    /// Number of distinct keys hammered concurrently
    #[structopt(short = "u", long, default_value = "10")]
    num_users: usize,

    /// Number of requests per key
    #[structopt(short = "r", long, default_value = "500")]
    requests_per_user: usize,

    /// Number of iterations to run
    #[structopt(short, long, default_value = "3")]
    iterations: usize,

    /// Maximum number of in-flight requests
    #[structopt(short = "c", long, default_value = "100")]
    concurrency: usize,

    /// Verbosity level
    #[structopt(short, long, parse(from_occurrences))]
    verbose: usize,
}

impl Opt {
    fn algorithm_config(&self, name: &str) -> Result<AlgorithmConfig, Box<dyn std::error::Error>> {
        let window = WindowConfig::new(self.max_requests, Duration::from_secs(self.window_seconds));
        let config = match name {
            "fixed-window" => AlgorithmConfig::FixedWindow(window),
            "sliding-window" => AlgorithmConfig::SlidingWindow(window),
            // refills the whole capacity once per window
            "token-bucket" => AlgorithmConfig::TokenBucket(TokenBucketConfig {
                capacity: self.max_requests,
                refill_rate: self.max_requests,
                refill_interval: Duration::from_secs(self.window_seconds),
            }),
            other => return Err(format!("Unknown algorithm: {}", other).into()),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Outcome of one benchmark run
struct BenchResult {
    name: &'static str,
    backend: &'static str,
    requests: usize,
    allowed: usize,
    errors: usize,
    expected_allowed: usize,
    elapsed: Duration,
}

impl BenchResult {
    fn overshoot(&self) -> isize {
        self.allowed as isize - self.expected_allowed as isize
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    let log_level = match opt.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "gatekeeper_bench={},gatekeeper={}",
            log_level, log_level
        )))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let clock = clock::system();
    let settings = StoreSettings {
        redis_url: opt.redis_url.clone(),
        redis: RedisConfig {
            health_check_interval: Duration::ZERO,
            ..RedisConfig::default()
        },
        memory: InMemoryConfig {
            max_entries: 1_000_000,
            ..InMemoryConfig::default()
        },
    };
    let store = storage::connect(&settings, clock.clone()).await;

    let names: Vec<&str> = if opt.algorithm == "all" {
        vec!["fixed-window", "sliding-window", "token-bucket"]
    } else {
        vec![opt.algorithm.as_str()]
    };

    let mut results = Vec::new();
    for name in names {
        let config = opt.algorithm_config(name)?;
        let limiter = algorithms::build(&config, store.clone(), clock.clone());
        results.push(run_benchmark(limiter, store.as_ref(), &opt).await?);
    }

    print_results(&results);
    Ok(())
}

async fn run_benchmark(
    limiter: Arc<dyn RateLimitAlgorithm>,
    store: &dyn CounterStore,
    opt: &Opt,
) -> Result<BenchResult, Box<dyn std::error::Error>> {
    let total_per_iteration = opt.num_users * opt.requests_per_user;
    let progress = ProgressBar::new((total_per_iteration * opt.iterations) as u64);
    progress.set_style(
        ProgressStyle::with_template("{msg:>16} [{bar:40}] {pos}/{len} ({per_sec})")?
            .progress_chars("=> "),
    );
    progress.set_message(limiter.name());

    let mut result = BenchResult {
        name: limiter.name(),
        backend: store.backend_name(),
        requests: 0,
        allowed: 0,
        errors: 0,
        expected_allowed: 0,
        elapsed: Duration::ZERO,
    };

    for iteration in 0..opt.iterations {
        info!(iteration = iteration + 1, algorithm = limiter.name(), "Starting iteration");

        // fresh keys each iteration so every run starts from a full limit
        let keys: Vec<String> = (0..opt.num_users)
            .map(|user| format!("bench:{}:{}:{}", limiter.name(), iteration, user))
            .collect();
        for key in &keys {
            limiter.reset(key).await?;
        }

        let barrier = Arc::new(Barrier::new(opt.num_users));
        let semaphore = Arc::new(Semaphore::new(opt.concurrency.max(1)));
        let started = Instant::now();

        let handles: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                let semaphore = semaphore.clone();
                let progress = progress.clone();
                let requests = opt.requests_per_user;

                tokio::spawn(async move {
                    barrier.wait().await;
                    let mut allowed = 0;
                    let mut errors = 0;

                    for _ in 0..requests {
                        let _permit = match semaphore.acquire().await {
                            Ok(permit) => permit,
                            Err(_) => break,
                        };
                        match limiter.consume(&key, 1).await {
                            Ok(status) if status.allowed => allowed += 1,
                            Ok(_) => {}
                            Err(e) => {
                                errors += 1;
                                warn!(key = %key, error = %e, "Limiter call failed");
                            }
                        }
                        progress.inc(1);
                    }
                    (allowed, errors)
                })
            })
            .collect();

        for outcome in futures::future::join_all(handles).await {
            match outcome {
                Ok((allowed, errors)) => {
                    result.allowed += allowed;
                    result.errors += errors;
                }
                Err(e) => warn!(error = %e, "Benchmark task panicked"),
            }
        }

        result.elapsed += started.elapsed();
        result.requests += total_per_iteration;
        result.expected_allowed +=
            opt.num_users * (opt.max_requests as usize).min(opt.requests_per_user);
    }

    progress.finish_with_message(format!("{} done", limiter.name()));
    Ok(result)
}

fn print_results(results: &[BenchResult]) {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Algorithm"),
        Cell::new("Backend"),
        Cell::new("Requests"),
        Cell::new("Allowed"),
        Cell::new("Expected"),
        Cell::new("Overshoot"),
        Cell::new("Errors"),
        Cell::new("Req/sec"),
    ]));

    for result in results {
        let throughput = result.requests as f64 / result.elapsed.as_secs_f64().max(f64::EPSILON);
        table.add_row(Row::new(vec![
            Cell::new(result.name),
            Cell::new(result.backend),
            Cell::new(&result.requests.to_string()),
            Cell::new(&result.allowed.to_string()),
            Cell::new(&result.expected_allowed.to_string()),
            Cell::new(&result.overshoot().to_string()),
            Cell::new(&result.errors.to_string()),
            Cell::new(&format!("{:.0}", throughput)),
        ]));
    }

    println!();
    table.printstd();
}
