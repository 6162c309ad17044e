//! Gleaner main entry point
//!
//! This is the command-line interface for the Gleaner catalog harvester.

use anyhow::Context;
use clap::Parser;
use gleaner::aggregator::DataAggregator;
use gleaner::config::{load_config_with_hash, Config};
use gleaner::crawler::run_crawl;
use gleaner::output::{load_statistics, print_sample, print_statistics};
use gleaner::storage::{SqliteCheckpointStore, SqliteRecordSink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Gleaner: a concurrent catalog harvester
///
/// Gleaner runs a bounded pool of scraping sessions over a paginated
/// catalog, retries failed targets, checkpoints progress so an interrupted
/// run can resume, and writes deduplicated records to an append-only sink.
#[derive(Parser, Debug)]
#[command(name = "gleaner")]
#[command(version)]
#[command(about = "A concurrent catalog harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Resume sessions interrupted by a previous run (default behavior)
    #[arg(long, conflicts_with = "fresh")]
    resume: bool,

    /// Discard checkpoints from previous runs before starting
    #[arg(long, conflicts_with = "resume")]
    fresh: bool,

    /// Validate config and show what would be harvested without harvesting
    #[arg(long, conflicts_with_all = ["stats", "sample"])]
    dry_run: bool,

    /// Show record and checkpoint statistics and exit
    #[arg(long, conflicts_with_all = ["dry_run", "sample"])]
    stats: bool,

    /// Print the last N written records and exit
    #[arg(long, value_name = "N", conflicts_with_all = ["dry_run", "stats"])]
    sample: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("Invalid configuration in {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if let Some(limit) = cli.sample {
        handle_sample(&config, limit)?;
    } else {
        handle_harvest(config, config_hash, cli.fresh).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("gleaner=info,warn"),
            1 => EnvFilter::new("gleaner=debug,info"),
            2 => EnvFilter::new("gleaner=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would run
fn handle_dry_run(config: &Config) {
    println!("=== Gleaner Dry Run ===\n");

    let scraping = &config.scraping;
    println!("Scraping:");
    println!("  Max concurrent sessions: {}", scraping.max_concurrent_sessions);
    println!("  Max attempts per target: {}", scraping.max_retries);
    println!("  Retry delay: {}ms", scraping.retry_delay_ms);
    println!(
        "  Page delay: {}-{}ms",
        scraping.scrape_delay_min_ms, scraping.scrape_delay_max_ms
    );
    println!("  Max pages per target: {}", scraping.max_pages_per_target);
    println!("  Session timeout: {}s", scraping.session_timeout_secs);
    println!("  User agent: {}", scraping.user_agent);

    println!("\nData:");
    println!("  Sink: {}", config.data.output_path);
    println!("  Report: {}", config.data.report_path);
    println!(
        "  Flush: every {} records or {}ms",
        config.data.buffer_size, config.data.write_interval_ms
    );
    let columns: Vec<&str> = config.data.columns().iter().map(|c| c.name()).collect();
    println!("  Columns: {}", columns.join(", "));

    println!("\nCheckpoints: {}", config.checkpoint.database_path);

    println!("\nTargets ({}):", config.targets.len());
    for target in &config.targets {
        println!("  - {} -> {}", target.key, target.url);
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would harvest {} targets with {} workers",
        config.targets.len(),
        scraping.max_concurrent_sessions
    );
}

/// Handles the --stats mode: shows what the durable stores hold
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    let store = SqliteCheckpointStore::new(Path::new(&config.checkpoint.database_path))
        .context("Failed to open checkpoint store")?;
    let sink = match SqliteRecordSink::open_existing(Path::new(&config.data.output_path))
        .context("Failed to open record sink")?
    {
        Some(sink) => sink,
        None => {
            println!("No record sink at {} yet\n", config.data.output_path);
            SqliteRecordSink::open_in_memory().context("Failed to open record sink")?
        }
    };

    let stats = load_statistics(&store, &sink)?;
    print_statistics(&stats);
    Ok(())
}

/// Handles the --sample mode: prints the newest written records
fn handle_sample(config: &Config, limit: usize) -> anyhow::Result<()> {
    let Some(sink) = SqliteRecordSink::open_existing(Path::new(&config.data.output_path))
        .context("Failed to open record sink")?
    else {
        print_sample(&[]);
        return Ok(());
    };
    let aggregator = DataAggregator::new(
        Arc::new(sink),
        config.data.columns(),
        config.data.buffer_size,
        config.data.write_interval(),
    )
    .context("Failed to initialize record sink")?;

    let rows = aggregator.sample(limit)?;
    print_sample(&rows);
    Ok(())
}

/// Handles the main harvest
async fn handle_harvest(config: Config, config_hash: String, fresh: bool) -> anyhow::Result<()> {
    if fresh {
        tracing::info!("Starting fresh harvest (discarding checkpoints)");
    } else {
        tracing::info!("Starting harvest (will resume interrupted sessions)");
    }
    tracing::info!(
        "Targets: {}, workers: {}",
        config.targets.len(),
        config.scraping.max_concurrent_sessions
    );

    let report = run_crawl(config, config_hash, fresh)
        .await
        .context("Harvest failed")?;

    tracing::info!(
        "Harvest finished: {}/{} tasks completed, {} records written",
        report.tasks.completed,
        report.tasks.total_tasks,
        report.data.total_written
    );
    Ok(())
}
