//! Handle registry soak runner
//!
//! Drives one registry from many threads at once. Every worker acquires its
//! own shard, churns items through it and checks that each tag resolves to
//! the item it was issued for.
//!
//! # Examples
//!
//! ```bash
//! # Eight workers, defaults everywhere else
//! registry-soak --threads 8
//!
//! # Small dimensions from a file, dump counters at the end
//! registry-soak --config registry.toml --items 5000 --metrics
//! ```

use clap::Parser;
use handle_registry::{Registry, RegistryConfig, ShardGuard, Tag};
use prometheus::{Encoder, TextEncoder};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Concurrent soak test for the handle registry
#[derive(Parser, Debug)]
#[command(name = "registry-soak")]
#[command(version = handle_registry::VERSION)]
#[command(about = "Concurrent soak test for the handle registry", long_about = None)]
struct Cli {
    /// Registry configuration file (TOML)
    #[arg(short, long, env = "HANDLE_REGISTRY_CONFIG")]
    config: Option<PathBuf>,

    /// Worker threads
    #[arg(short, long, default_value = "4")]
    threads: usize,

    /// Items each worker keeps registered per round
    #[arg(short, long, default_value = "10000")]
    items: usize,

    /// Churn rounds per worker
    #[arg(short, long, default_value = "10")]
    rounds: usize,

    /// Print prometheus counters when done
    #[arg(long)]
    metrics: bool,

    /// Log directory path
    #[arg(long, default_value = "logs", env = "HANDLE_REGISTRY_LOG_DIR")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

/// Item stored by the workers: (worker, sequence)
type Entry = (usize, u64);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli)?;

    let config = RegistryConfig::load(cli.config.as_deref())?;
    let registry: Registry<Entry> = Registry::new(config)?;

    let prometheus_registry = prometheus::Registry::new();
    registry.metrics().register(&prometheus_registry)?;

    info!(
        version = %handle_registry::VERSION,
        threads = cli.threads,
        items = cli.items,
        rounds = cli.rounds,
        "Starting soak run"
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.threads)
        .thread_name(|i| format!("soak-worker-{}", i))
        .build()?;

    let mismatches = AtomicU64::new(0);
    let started = Instant::now();

    let issued: Vec<u64> = pool.broadcast(|ctx| {
        let shard = registry.shard();
        let mut issued = 0;
        for round in 0..cli.rounds {
            issued += churn(&shard, ctx.index(), round, cli.items, &mismatches);
        }
        issued
    });

    let elapsed = started.elapsed();
    let issued: u64 = issued.iter().sum();
    let mismatches = mismatches.load(Ordering::Relaxed);
    let stats = registry.stats();

    info!(
        issued,
        mismatches,
        faults = stats.faults(),
        shared_leftovers = registry.shared_len(),
        elapsed_ms = elapsed.as_millis() as u64,
        "Soak run finished"
    );

    println!("Handle registry soak {}", handle_registry::VERSION);
    println!("  Tags issued:   {}", issued);
    println!(
        "  Throughput:    {:.0} tags/s",
        issued as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("  Mismatches:    {}", mismatches);
    println!(
        "  Shards:        {} acquired / {} released / {} fallbacks",
        stats.shards_acquired, stats.shards_released, stats.shard_pool_exhausted
    );
    println!("  Faults:        {}", stats.faults());

    if cli.metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus_registry.gather(), &mut buffer)?;
        println!("{}", String::from_utf8(buffer)?);
    }

    if mismatches > 0 {
        anyhow::bail!("{} tags resolved to the wrong item", mismatches);
    }
    Ok(())
}

/// One round: fill, verify, free every other item, refill, drain
fn churn(
    shard: &ShardGuard<'_, Entry>,
    worker: usize,
    round: usize,
    items: usize,
    mismatches: &AtomicU64,
) -> u64 {
    let base = (round * items * 2) as u64;
    let mut live: Vec<(Tag, Entry)> = (0..items as u64)
        .map(|seq| {
            let entry = (worker, base + seq);
            (shard.insert(entry), entry)
        })
        .collect();

    let check = |tag: Tag, expected: Entry, found: Option<Entry>| {
        if tag.is_none() || found != Some(expected) {
            warn!(worker, %tag, ?expected, ?found, "Tag resolved to the wrong item");
            mismatches.fetch_add(1, Ordering::Relaxed);
        }
    };

    for &(tag, entry) in &live {
        check(tag, entry, shard.lookup(tag));
    }

    let mut refilled = 0;
    for (i, slot) in live.iter_mut().enumerate().filter(|(i, _)| i % 2 == 0) {
        check(slot.0, slot.1, shard.remove(slot.0));

        let entry = (worker, base + items as u64 + i as u64);
        *slot = (shard.insert(entry), entry);
        refilled += 1;
    }

    for (tag, entry) in live {
        check(tag, entry, shard.remove(tag));
    }

    (items + refilled) as u64
}

/// Setup logging with rolling files and console output
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    std::fs::create_dir_all(&cli.log_dir)?;

    let file_appender =
        RollingFileAppender::new(Rotation::DAILY, &cli.log_dir, "registry-soak.jsonl");

    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(!cli.no_color)
                .pretty(),
        )
        // one JSON object per line
        .with(fmt::layer().json().with_writer(file_appender))
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}
