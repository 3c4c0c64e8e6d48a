//! tiercache contention demo
//!
//! Runs concurrent writers against one hot key and checks that no update
//! was lost.
//!
//! ```text
//! ┌──────────┐   update(hot)   ┌──────────┐   CAS   ┌───────────────────────┐
//! │ writer 0 │────────────────▶│          │────────▶│ FaultInjectingBackend │
//! │ writer 1 │────────────────▶│ Cache<C> │         │   (forced conflicts)  │
//! │   ...    │────────────────▶│          │         │           │           │
//! └──────────┘                 └──────────┘         │    InMemoryBackend    │
//!                                                   └───────────────────────┘
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{ensure, Context};
use clap::Parser;
use futures::future::try_join_all;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{Cache, CacheConfig, RetryPolicy};
use tiercache::entity::{Entity, Field, FieldAccess};
use tiercache::health::HealthReport;
use tiercache::registry::Registry;
use tiercache::{FaultInjectingBackend, InMemoryBackend};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Concurrent update demo for tiercache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of concurrent writers
    #[arg(long, env = "DEMO_WRITERS", default_value = "8")]
    writers: usize,

    /// Updates issued by each writer
    #[arg(long, env = "DEMO_UPDATES", default_value = "25")]
    updates: usize,

    /// Probability of forcing a lost CAS race on any attempt
    #[arg(long, env = "DEMO_CONFLICT_RATE", default_value = "0.05")]
    conflict_rate: f64,

    /// Maximum attempts per update
    #[arg(long, env = "DEMO_MAX_ATTEMPTS", default_value = "15")]
    max_attempts: u32,

    /// Base backoff delay in milliseconds
    #[arg(long, env = "DEMO_BASE_DELAY_MS", default_value = "5")]
    base_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Demo entity
// =============================================================================

#[derive(Clone)]
struct Counter {
    label: Field<String>,
    hits: Field<i64>,
    writers: Field<Vec<usize>>,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            label: Field::new("label"),
            hits: Field::with_default("hits", 0),
            writers: Field::with_default("writers", Vec::new()),
        }
    }
}

impl Entity for Counter {
    type Key = String;

    fn fields(&self) -> Vec<&dyn FieldAccess> {
        vec![&self.label, &self.hits, &self.writers]
    }

    fn fields_mut(&mut self) -> Vec<&mut dyn FieldAccess> {
        vec![&mut self.label, &mut self.hits, &mut self.writers]
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting tiercache contention demo");
    info!("  Writers: {}", args.writers);
    info!("  Updates per writer: {}", args.updates);
    info!("  Forced conflict rate: {}", args.conflict_rate);

    let backend = Arc::new(FaultInjectingBackend::new(Arc::new(InMemoryBackend::new())));
    backend.set_conflict_rate(args.conflict_rate);

    let base = Duration::from_millis(args.base_delay_ms);
    let config = CacheConfig {
        retry: RetryPolicy::default()
            .with_max_attempts(args.max_attempts)
            .with_delays(base, base, base * 40),
        ..Default::default()
    };

    let registry = Registry::new();
    let counters = registry.register_cache(Cache::<Counter>::with_config("counters", backend.clone(), config)?)?;
    registry.start_all()?;

    let key = "hot".to_string();
    counters
        .read_or_create(key.clone(), |counter| counter.label.set("hot counter".into()))
        .await?;

    let started = Instant::now();
    let tasks = (0..args.writers).map(|writer| {
        let counters = Arc::clone(&counters);
        let key = key.clone();
        let updates = args.updates;
        tokio::spawn(async move {
            for _ in 0..updates {
                counters
                    .update(&key, |counter| {
                        let hits = *counter.hits.get_or(&0)?;
                        counter.hits.set(hits + 1)?;
                        counter.writers.modify(|writers| {
                            let writers = writers.get_or_insert_with(Vec::new);
                            if !writers.contains(&writer) {
                                writers.push(writer);
                            }
                        })
                    })
                    .await?;
            }
            Ok::<_, tiercache::Error>(())
        })
    });

    for result in try_join_all(tasks).await.context("writer task panicked")? {
        result?;
    }
    let elapsed = started.elapsed();

    let handle = counters
        .read(&key)
        .await?
        .context("hot counter disappeared")?;
    let expected = (args.writers * args.updates) as i64;
    let hits = *handle.entity().hits.get_or(&0)?;

    info!(
        version = handle.version(),
        hits,
        elapsed_ms = elapsed.as_millis() as u64,
        "All writers finished"
    );

    println!("{}", serde_json::to_string_pretty(&counters.metrics())?);
    println!("{}", serde_json::to_string_pretty(&backend.fault_stats())?);
    println!("{}", serde_json::to_string_pretty(&HealthReport::collect(&registry))?);

    ensure!(
        handle.version() == expected,
        "lost updates: version {} != {}",
        handle.version(),
        expected
    );
    ensure!(hits == expected, "lost increments: {} != {}", hits, expected);

    registry.shutdown_all()?;
    info!("Demo complete, no update lost");
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
