//! Stresstest tool for `recache`.
//!
//! Hammers a single cache with a configurable number of concurrent workers
//! over a synthetic keyspace, with a resolver that simulates latency and a
//! configurable failure rate, then reports how many accesses were served
//! per actual resolution.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::BoxFuture;
use humantime::parse_duration;

use recache::{BackgroundCache, CacheConfig, CacheError, CacheResult, Resolver};

#[derive(Debug, Clone, thiserror::Error)]
#[error("synthetic lookup failure")]
struct LookupFailed;

/// Simulates the expensive lookup: sleeps for the configured latency, then
/// fails with the memoizable kind at the configured rate.
struct SyntheticResolver {
    latency: Duration,
    failure_rate: f64,
    resolutions: AtomicUsize,
}

impl Resolver<String, String, LookupFailed> for SyntheticResolver {
    fn resolve(&self, key: String) -> BoxFuture<'_, CacheResult<String, LookupFailed>> {
        let n = self.resolutions.fetch_add(1, Ordering::Relaxed);
        let latency = self.latency;
        let failure_rate = self.failure_rate;
        Box::pin(async move {
            tokio::time::sleep(latency).await;
            if rand::random_bool(failure_rate) {
                Err(CacheError::Resolve(LookupFailed))
            } else {
                Ok(format!("{key}#{n}"))
            }
        })
    }
}

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Number of distinct keys in the workload.
    #[arg(long, default_value_t = 64)]
    keys: usize,

    /// Number of concurrent workers.
    #[arg(long, short = 'c', default_value_t = 16)]
    concurrency: usize,

    /// Duration of the stresstest.
    #[arg(long, short = 'd', value_parser = parse_duration, default_value = "10s")]
    duration: Duration,

    /// Age at which entries refresh in the background.
    #[arg(long, value_parser = parse_duration, default_value = "100ms")]
    refresh_interval: Duration,

    /// Age at which entries expire.
    #[arg(long, value_parser = parse_duration, default_value = "2s")]
    expiration_age: Duration,

    /// Simulated latency of one resolution.
    #[arg(long, value_parser = parse_duration, default_value = "5ms")]
    resolve_latency: Duration,

    /// Fraction of resolutions that fail with the memoizable kind.
    #[arg(long, default_value_t = 0.1)]
    failure_rate: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt::init();

    let config = CacheConfig {
        refresh_interval: cli.refresh_interval,
        expiration_age: cli.expiration_age,
        ..Default::default()
    };
    let cache: Arc<BackgroundCache<String, String, LookupFailed>> =
        Arc::new(BackgroundCache::new("stress", config).context("failed creating cache")?);
    cache.start();

    let resolver = Arc::new(SyntheticResolver {
        latency: cli.resolve_latency,
        failure_rate: cli.failure_rate,
        resolutions: AtomicUsize::new(0),
    });

    let started = Instant::now();
    let deadline = started + cli.duration;

    let workers: Vec<_> = (0..cli.concurrency)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let resolver = Arc::clone(&resolver);
            let keys = cli.keys;
            tokio::spawn(async move {
                let mut served = 0_usize;
                let mut failed = 0_usize;
                while Instant::now() < deadline {
                    let key = format!("key-{}", rand::random_range(0..keys));
                    match cache.get(key, resolver.clone()).await {
                        Ok(_) => served += 1,
                        Err(CacheError::Resolve(_)) => failed += 1,
                        Err(CacheError::Internal(error)) => {
                            tracing::error!(error = %error, "unexpected resolution failure");
                        }
                    }
                }
                (served, failed)
            })
        })
        .collect();

    let mut served = 0_usize;
    let mut failed = 0_usize;
    for worker in workers {
        let (ok, err) = worker.await.context("worker panicked")?;
        served += ok;
        failed += err;
    }

    let elapsed = started.elapsed();
    let accesses = served + failed;
    let resolutions = resolver.resolutions.load(Ordering::Relaxed);

    cache.stop();

    println!("ran {} accesses in {:.2?}", accesses, elapsed);
    println!("  served:      {served}");
    println!("  failed:      {failed} (memoized failures)");
    println!("  resolutions: {resolutions}");
    println!(
        "  accesses per resolution: {:.1}",
        accesses as f64 / resolutions.max(1) as f64
    );
    println!(
        "  throughput: {:.0} accesses/s",
        accesses as f64 / elapsed.as_secs_f64()
    );

    Ok(())
}
