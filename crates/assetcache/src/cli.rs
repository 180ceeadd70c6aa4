//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use assetcache_service::caching::{self, BytesDecoder, CacheKey};
use assetcache_service::config::Config;
use assetcache_service::download::HttpFetcher;
use assetcache_service::download::batch::{
    BatchEvent, BatchItem, Connection, DownloadStrategy, NetworkMonitor,
};
use assetcache_service::services::Engine;
use assetcache_service::types::Priority;
use assetcache_service::{logging, metrics};
use clap::{Parser, Subcommand};

use crate::output::{self, BatchReport, FetchReport, OutputFormat};

/// Asset cache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch assets through the cache and report where they were served from.
    Fetch {
        /// The urls to fetch.
        #[arg(required = true)]
        urls: Vec<String>,

        /// The priority of all requests: low, normal, high or critical.
        #[arg(long, default_value = "normal", value_parser = parse_priority)]
        priority: Priority,
    },

    /// Download a batch of assets.
    Batch {
        /// The urls to download.
        #[arg(required = true)]
        urls: Vec<String>,

        /// The download strategy: always, wifi_only, smart or manual.
        ///
        /// Defaults to the configured strategy.
        #[arg(long)]
        strategy: Option<DownloadStrategy>,

        /// Treat the connection as metered.
        #[arg(long)]
        metered: bool,
    },

    /// Trim the disk cache to its configured budget.
    Trim,

    /// Print the statistics of the configured caches.
    Stats,
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The output format.
    #[arg(long, value_enum, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    Priority::ALL
        .into_iter()
        .find(|priority| priority.as_str().eq_ignore_ascii_case(value))
        .ok_or_else(|| format!("unknown priority `{value}`"))
}

/// A [`NetworkMonitor`] reporting the connection given on the command line.
#[derive(Debug)]
struct StaticNetwork(Connection);

impl NetworkMonitor for StaticNetwork {
    fn connection(&self) -> Connection {
        self.0
    }
}

/// Creates an engine fetching over HTTP. Must be called within the runtime.
fn create_engine(config: Config, connection: Connection) -> Result<Engine<BytesDecoder>> {
    let fetcher =
        HttpFetcher::new((&config.loader).into()).context("failed to create HTTP client")?;
    Engine::new(
        config,
        Arc::new(fetcher),
        BytesDecoder,
        Arc::new(StaticNetwork(connection)),
    )
}

async fn fetch(config: Config, urls: Vec<String>, priority: Priority) -> Result<Vec<FetchReport>> {
    let engine = create_engine(config, Connection::Unmetered)?;

    // all loads are queued before the first one is awaited
    let loads: Vec<_> = urls
        .into_iter()
        .map(|url| {
            let load = engine.load(CacheKey::new(&url), &url, priority);
            (url, load)
        })
        .collect();

    let mut reports = Vec::with_capacity(loads.len());
    for (url, load) in loads {
        reports.push(FetchReport::new(url, load.await));
    }

    engine.shutdown();
    Ok(reports)
}

async fn batch(
    config: Config,
    urls: Vec<String>,
    strategy: Option<DownloadStrategy>,
    connection: Connection,
) -> Result<BatchReport> {
    let engine = create_engine(config, connection)?;
    let batches = engine.batches();
    let strategy = strategy.unwrap_or(batches.default_strategy());

    let items = urls.into_iter().map(BatchItem::new).collect();
    let mut handle = batches.download_batch(items, strategy);

    let mut items = Vec::new();
    while let Some(event) = handle.next_event().await {
        match event {
            BatchEvent::ItemDone {
                index,
                key,
                outcome,
            } => items.push((index, key, outcome)),
            BatchEvent::Progress { completed, total } => {
                tracing::info!("Downloaded {}/{} items", completed, total)
            }
        }
    }
    let summary = handle.finished().await.context("the batch was abandoned")?;

    engine.shutdown();
    Ok(BatchReport::new(strategy, items, summary))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    // SAFETY: no other threads have been spawned yet.
    unsafe { logging::init_logging(&config.logging) };
    metrics::configure_statsd(&config.metrics).context("failed to configure statsd")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("assetcache-io")
        .enable_all()
        .build()?;

    let format = cli.format;
    match cli.command {
        Command::Fetch { urls, priority } => {
            let reports = runtime.block_on(fetch(config, urls, priority))?;
            output::print_fetches(format, &reports)?;
        }
        Command::Batch {
            urls,
            strategy,
            metered,
        } => {
            let connection = match metered {
                true => Connection::Metered,
                false => Connection::Unmetered,
            };
            let report = runtime.block_on(batch(config, urls, strategy, connection))?;
            output::print_batch(format, &report)?;
        }
        Command::Trim => {
            let stats = caching::trim(&config).context("failed to trim the disk cache")?;
            output::print_disk_stats(format, &stats)?;
        }
        Command::Stats => {
            let stats = runtime.block_on(async {
                let engine = create_engine(config, Connection::Unmetered)?;
                let stats = engine.stats();
                engine.shutdown();
                anyhow::Ok(stats)
            })?;
            output::print_stats(format, &stats)?;
        }
    }

    Ok(())
}
