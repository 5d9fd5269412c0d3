use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use hospital_geocoder::cache::{PruneOptions, ResultCache, DEFAULT_CLUSTER_THRESHOLD};
use hospital_geocoder::export::{read_report_file, write_output_file, write_review_file};
use hospital_geocoder::pipeline::{ProgressObserver, RunProgress};
use hospital_geocoder::registry::load_registry_file;
use hospital_geocoder::{init_tracing, AppConfig, BatchRunner, RunSettings};

const PROGRESS_EVERY: usize = 10;

/// Geocodes the Bulgarian hospital registry and reports coordinate quality.
#[derive(Parser, Debug)]
#[command(name = "hospital-geocoder")]
#[command(version)]
struct Cli {
    /// Log every resolution attempt
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Geocode a registry table and write the annotated output
    Run(RunArgs),
    /// Print the quality breakdown of a finished output table
    Report {
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Inspect or prune the result cache
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Registry CSV
    #[arg(short, long)]
    input: PathBuf,

    /// Annotated output CSV
    #[arg(short, long)]
    output: PathBuf,

    #[arg(long, env = "GEOCODER_CACHE_FILE")]
    cache: Option<PathBuf>,

    /// Manual review CSV for missing and low-scoring rows
    #[arg(long)]
    review: Option<PathBuf>,

    /// JSON file of manual coordinates keyed by `address||city`
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Directory for the attempt journal; defaults to the output directory
    #[arg(long)]
    journal_dir: Option<PathBuf>,

    /// Process only the first N records
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Entry counts by status, provider and strategy
    Stats {
        #[arg(long, env = "GEOCODER_CACHE_FILE")]
        cache: Option<PathBuf>,
    },
    /// Drop no-result markers and keys clustered on one coordinate
    Prune {
        #[arg(long, env = "GEOCODER_CACHE_FILE")]
        cache: Option<PathBuf>,

        #[arg(long)]
        no_results: bool,

        // bare flag means DEFAULT_CLUSTER_THRESHOLD
        #[arg(long, num_args = 0..=1, default_missing_value = "3")]
        cluster_threshold: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = AppConfig::from_env();

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::Report { input } => {
            let report = read_report_file(&input)
                .with_context(|| format!("failed to read output table {}", input.display()))?;
            println!("{report}");
            Ok(())
        }
        Command::Cache { command } => cache_command(&config, command),
    }
}

async fn run(config: AppConfig, args: RunArgs) -> Result<()> {
    info!(
        config = %serde_json::to_string(&config.public_profile())?,
        "configuration loaded"
    );

    let load = load_registry_file(&args.input)
        .with_context(|| format!("failed to load registry {}", args.input.display()))?;
    let settings = RunSettings {
        cache_file: args.cache.clone().unwrap_or_else(|| config.cache_file.clone()),
        overrides_file: args.overrides.clone(),
        journal_dir: Some(
            args.journal_dir
                .clone()
                .unwrap_or_else(|| parent_or_current(&args.output)),
        ),
    };
    let runner = BatchRunner::from_config(&config, &settings)
        .context("failed to initialise geocoding run")?;

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing current record");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }
    let observer: ProgressObserver = Arc::new(|progress: RunProgress| {
        if progress.processed % PROGRESS_EVERY == 0 || progress.processed == progress.total {
            info!(
                processed = progress.processed,
                total = progress.total,
                resolved = progress.resolved,
                "progress"
            );
        }
    });

    let outcome = runner
        .run(load, args.limit, Some(observer), Some(cancel))
        .await?;

    write_output_file(&args.output, &outcome.records)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(path = %args.output.display(), rows = outcome.records.len(), "output written");
    if let Some(review) = &args.review {
        let rows = write_review_file(review, &outcome.records)
            .with_context(|| format!("failed to write {}", review.display()))?;
        info!(path = %review.display(), rows, "review table written");
    }

    println!("{}", outcome.summary);
    Ok(())
}

fn cache_command(config: &AppConfig, command: CacheCommand) -> Result<()> {
    match command {
        CacheCommand::Stats { cache } => {
            let cache = ResultCache::open(cache.unwrap_or_else(|| config.cache_file.clone()), 0);
            let stats = cache.stats();
            println!(
                "Entries: {} ({} found, {} no result)",
                stats.total, stats.found, stats.no_result
            );
            println!("Providers:");
            for (provider, count) in &stats.by_provider {
                println!("  {provider:<16} {count:>5}");
            }
            println!("Strategies:");
            for (strategy, count) in &stats.by_strategy {
                println!("  {strategy:<16} {count:>5}");
            }
            Ok(())
        }
        CacheCommand::Prune {
            cache,
            no_results,
            cluster_threshold,
        } => {
            if !no_results && cluster_threshold.is_none() {
                bail!(
                    "nothing to prune; pass --no-results and/or --cluster-threshold (default {DEFAULT_CLUSTER_THRESHOLD})"
                );
            }
            let cache = ResultCache::open(cache.unwrap_or_else(|| config.cache_file.clone()), 0);
            let report = cache.prune(PruneOptions {
                no_results,
                cluster_threshold,
            });
            cache.flush().context("failed to write pruned cache")?;
            println!(
                "Removed {} no-result and {} clustered entries; {} remain",
                report.removed_no_results, report.removed_clustered, report.remaining
            );
            Ok(())
        }
    }
}

fn parent_or_current(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
