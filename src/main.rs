//! Board Watch
//!
//! Harvests an imageboard on a schedule, runs analyzers over every harvested
//! batch and publishes LLM-written summaries.
//!
//! Usage:
//!   board-watch                      # Run the scheduler until Ctrl-C
//!   board-watch --harvest-once       # One harvest + analysis pass
//!   board-watch --summarize-once     # One summarization batch
//!   board-watch --post-once          # Post the next unposted article
//!   board-watch --maintain           # Retention sweep and analyzer purge
//!   board-watch --stats              # Show storage statistics
//!   board-watch --show geography     # Print an analyzer's stored results

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use board_watch::analyzers::{Registry, StoreView};
use board_watch::config::Config;
use board_watch::llm::RetryPolicy;
use board_watch::{
    Database, DryRunPostingClient, Harvester, HttpBoardClient, Maintenance, OpenAiTransport, Poster,
    RetryingClient, Scheduler, Summarizer, ThreadStore,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "board-watch", version, about = "Imageboard harvester, analyzer and summarizer")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config/settings.toml")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single harvest and exit
    #[arg(long)]
    harvest_once: bool,

    /// Run a single summarization batch and exit
    #[arg(long)]
    summarize_once: bool,

    /// Post the next unposted article and exit
    #[arg(long)]
    post_once: bool,

    /// Sweep old threads and purge old analyzer results
    #[arg(long)]
    maintain: bool,

    /// Show storage statistics
    #[arg(long)]
    stats: bool,

    /// Print the stored results of one analyzer
    #[arg(long, value_name = "ANALYZER")]
    show: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,reqwest=warn,rustls=warn", args.log_level))
    });
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(&args.config)?;
    info!("Loaded configuration from {}", args.config.display());

    if args.stats {
        run_storage_stats(&config)
    } else if args.maintain {
        run_maintenance(&config)
    } else if let Some(name) = &args.show {
        show_results(&config, name)
    } else if args.harvest_once {
        let stats = build_harvester(&config)?.harvest().await?;
        println!("{:#?}", stats);
        Ok(())
    } else if args.summarize_once {
        let summary = build_summarizer(&config)?.summarize().await?;
        println!(
            "Summarized {} threads (mean {:.1}% flagged)",
            summary.batch.articles.len(),
            summary.matrix.mean_percentage
        );
        Ok(())
    } else if args.post_once {
        match build_poster(&config)?.post_next().await? {
            Some((thread_id, external_id)) => println!("Posted thread {} as {}", thread_id, external_id),
            None => println!("Nothing posted"),
        }
        Ok(())
    } else {
        run_scheduler(&config).await
    }
}

fn build_registry(config: &Config) -> Result<Registry> {
    let mut registry = Registry::with_defaults(&config.storage.analyzers_dir(), &config.analyzers)?;
    registry.initialize();
    Ok(registry)
}

fn build_harvester(config: &Config) -> Result<Harvester> {
    let client = Arc::new(HttpBoardClient::new(&config.board)?);
    Ok(Harvester::new(
        client,
        ThreadStore::new(config.storage.threads_dir()),
        build_registry(config)?,
        Maintenance::new(&config.storage, config.retention.clone()),
        config.storage.media_dir(),
        config.harvester.clone(),
    ))
}

fn build_summarizer(config: &Config) -> Result<Summarizer> {
    let transport = OpenAiTransport::new(&config.llm)?;
    let llm = Arc::new(RetryingClient::new(transport, RetryPolicy::from(&config.llm)));
    Ok(Summarizer::new(
        llm,
        &config.storage,
        &config.selector,
        &config.summarizer,
    ))
}

fn build_poster(config: &Config) -> Result<Poster> {
    Ok(Poster::new(
        Arc::new(DryRunPostingClient::default()),
        Database::new(config.storage.ledger_path())?,
        config.storage.summary_path(),
        config.board.clone(),
        config.posting.clone(),
    ))
}

/// Run all three tasks until Ctrl-C
async fn run_scheduler(config: &Config) -> Result<()> {
    let scheduler = Scheduler::from_config(
        &config.scheduler,
        Arc::new(build_harvester(config)?),
        Arc::new(build_summarizer(config)?),
        Arc::new(build_poster(config)?),
    );

    scheduler.start();
    info!("Scheduler {}; press Ctrl-C to stop", scheduler.state());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, waiting for in-flight tasks...");
    scheduler.stop();
    scheduler.join().await;

    info!("Scheduler {}", scheduler.state());
    Ok(())
}

fn run_storage_stats(config: &Config) -> Result<()> {
    info!("Gathering storage statistics...");
    let maint = Maintenance::new(&config.storage, config.retention.clone());
    maint.stats()?.print_report();
    Ok(())
}

fn run_maintenance(config: &Config) -> Result<()> {
    info!("Running maintenance with {:?}", config.retention);

    let maint = Maintenance::new(&config.storage, config.retention.clone());
    let swept = maint.sweep_threads()?;
    let purged = build_registry(config)?.purge_old_results()?;

    println!("\nMaintenance complete:");
    println!("  Threads deleted:   {}", swept.threads_deleted);
    println!("  Media deleted:     {}", swept.media_deleted);
    println!("  Space freed:       {}", board_watch::maintenance::format_bytes(swept.bytes_freed));
    println!("  Analyzers purged:  {}", purged.succeeded.len());
    if !purged.failed.is_empty() {
        println!("  Purge failures:    {}", purged.failed.len());
    }
    Ok(())
}

fn show_results(config: &Config, name: &str) -> Result<()> {
    let registry = build_registry(config)?;
    let Some(analyzer) = registry.get(name) else {
        bail!("Unknown analyzer '{}'; available: {}", name, registry.names().join(", "));
    };

    match analyzer.view_json()? {
        StoreView::NoResults => println!("{}: no results available", name),
        StoreView::Results { last_updated, results } => {
            println!("{}: {} results (updated {})", name, results.len(), last_updated);
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }
    Ok(())
}
