//! Runs a batch of simulated operations through an `OperationQueue`.
//!
//! Each operation sleeps for a random delay and then succeeds or fails with
//! the configured probability. Set `RUST_LOG` to override the log filter.

use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use opqueue::{Operation, OperationQueue, QueueConfig, SelectionPolicy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opqueue-demo", about = "Run simulated operations through a bounded queue")]
struct Args {
    /// Maximum number of operations running at once.
    #[arg(long, env = "OPQUEUE_CONCURRENCY", default_value_t = 3)]
    concurrency: usize,

    /// Number of operations to run.
    #[arg(long, env = "OPQUEUE_OPERATIONS", default_value_t = 7)]
    operations: usize,

    /// Probability in [0, 1] that an operation fails.
    #[arg(
        long,
        env = "OPQUEUE_FAILURE_RATE",
        default_value_t = 0.0,
        value_parser = parse_failure_rate
    )]
    failure_rate: f64,

    /// Upper bound of each operation's random run time.
    #[arg(long, env = "OPQUEUE_MAX_DELAY_MS", default_value_t = 1_000)]
    max_delay_ms: u64,

    /// Dispatch order: `fifo` or `random`.
    #[arg(long, env = "OPQUEUE_POLICY", default_value_t = SelectionPolicy::Fifo)]
    policy: SelectionPolicy,

    /// Seed for delays, failures and random selection.
    #[arg(long, env = "OPQUEUE_SEED")]
    seed: Option<u64>,

    /// Log queue lifecycle events.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_failure_rate(s: &str) -> Result<f64, String> {
    let rate: f64 = s.parse().map_err(|err: std::num::ParseFloatError| err.to_string())?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{s} is not a probability in [0, 1]"))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = QueueConfig {
        verbose_logging: args.verbose,
        selection_policy: args.policy,
        random_seed: args.seed,
    };
    let queue = OperationQueue::new(args.concurrency, config)
        .context("failed to create operation queue")?;

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let operations: Vec<Operation> = (0..args.operations)
        .map(|i| {
            let delay = Duration::from_millis(rng.random_range(0..=args.max_delay_ms));
            let fails = rng.random_bool(args.failure_rate);
            Operation::from_future(async move {
                tokio::time::sleep(delay).await;
                if fails {
                    anyhow::bail!("simulated failure after {delay:?}");
                }
                Ok(())
            })
            .with_label(format!("task-{i}"))
        })
        .collect();

    let handle = queue
        .start_with(operations.iter().cloned())
        .await
        .context("failed to start operation queue")?;
    println!("queue running: {}", queue.is_running());

    match handle.await {
        Ok(()) => println!("all {} operations finished", operations.len()),
        Err(err) if err.is_fatal() => return Err(err).context("operation queue failed"),
        Err(err) => {
            let started = operations.iter().filter(|op| op.is_started()).count();
            println!(
                "queue cancelled ({err}); {started} of {} operations started",
                operations.len()
            );
        }
    }
    println!("queue running: {}", queue.is_running());

    Ok(())
}
