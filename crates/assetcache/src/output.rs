use std::io;

use anyhow::Result;
use assetcache_service::caching::{CacheContents, CacheKey, DiskStats};
use assetcache_service::download::batch::{BatchSummary, DownloadStrategy, ItemOutcome};
use assetcache_service::loader::Loaded;
use assetcache_service::services::EngineStats;
use assetcache_service::types::Origin;
use clap::ValueEnum;
use prettytable::format::consts::FORMAT_CLEAN;
use prettytable::{Table, row};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable tables.
    Table,
    /// The full report as JSON.
    Json,
}

/// The outcome of fetching a single url.
#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub origin: Option<Origin>,
    pub size: Option<usize>,
    pub error: Option<String>,
}

impl FetchReport {
    pub fn new<O: AsRef<[u8]>>(url: String, result: CacheContents<Loaded<O>>) -> Self {
        match result {
            Ok(loaded) => {
                let blob: &[u8] = (*loaded.object).as_ref();
                Self {
                    url,
                    origin: Some(loaded.origin),
                    size: Some(blob.len()),
                    error: None,
                }
            }
            Err(err) => Self {
                url,
                origin: None,
                size: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BatchItemReport {
    pub index: usize,
    pub key: String,
    pub outcome: &'static str,
    pub origin: Option<Origin>,
    pub error: Option<String>,
}

/// The outcome of a batch, with items in the order they were requested.
#[derive(Debug, Serialize)]
pub struct BatchReport {
    pub strategy: DownloadStrategy,
    pub items: Vec<BatchItemReport>,
    pub summary: BatchSummary,
}

impl BatchReport {
    pub fn new(
        strategy: DownloadStrategy,
        items: Vec<(usize, CacheKey, ItemOutcome)>,
        summary: BatchSummary,
    ) -> Self {
        let mut items: Vec<_> = items
            .into_iter()
            .map(|(index, key, outcome)| {
                let (outcome, origin, error) = match outcome {
                    ItemOutcome::Succeeded(origin) => ("ok", Some(origin), None),
                    ItemOutcome::Failed(err) => ("failed", None, Some(err.to_string())),
                    ItemOutcome::Skipped => ("skipped", None, None),
                };
                BatchItemReport {
                    index,
                    key: key.to_string(),
                    outcome,
                    origin,
                    error,
                }
            })
            .collect();
        items.sort_by_key(|item| item.index);

        Self {
            strategy,
            items,
            summary,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    serde_json::to_writer_pretty(io::stdout().lock(), value)?;
    println!();
    Ok(())
}

fn origin_str(origin: Option<Origin>) -> &'static str {
    origin.map_or("", Origin::as_str)
}

pub fn print_fetches(format: OutputFormat, reports: &[FetchReport]) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(&reports);
    }

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "Url", "Origin", "Size", "Error"]);
    for report in reports {
        let size = report.size.map(|size| size.to_string()).unwrap_or_default();
        table.add_row(row![
            report.url,
            origin_str(report.origin),
            r->size,
            report.error.as_deref().unwrap_or_default()
        ]);
    }
    table.printstd();
    Ok(())
}

pub fn print_batch(format: OutputFormat, report: &BatchReport) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![b => "#", "Url", "Outcome", "Origin", "Error"]);
    for item in &report.items {
        table.add_row(row![
            r->item.index,
            item.key,
            item.outcome,
            origin_str(item.origin),
            item.error.as_deref().unwrap_or_default()
        ]);
    }
    table.printstd();

    let summary = &report.summary;
    println!(
        "\n{} of {} items downloaded with strategy {}: {} failed, {} skipped",
        summary.succeeded, summary.total, report.strategy, summary.failed, summary.skipped,
    );
    Ok(())
}

fn disk_table(stats: &DiskStats) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row![b->"Disk", ""]);
    table.add_row(row![r->"  Entries:", stats.entry_count]);
    table.add_row(row![
        r->"  Size:",
        format!("{} of {} bytes", stats.total_bytes, stats.budget_bytes)
    ]);
    table.add_row(row![r->"  Hit rate:", format!("{:.1}%", stats.hit_rate * 100.0)]);
    table.add_row(row![r->"  Evictions:", stats.evictions]);
    table
}

pub fn print_disk_stats(format: OutputFormat, stats: &DiskStats) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(stats),
        OutputFormat::Table => {
            disk_table(stats).printstd();
            Ok(())
        }
    }
}

pub fn print_stats(format: OutputFormat, stats: &EngineStats) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(stats);
    }

    let memory = &stats.cache.memory;
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row![b->"Memory", ""]);
    table.add_row(row![r->"  Entries:", memory.entry_count]);
    table.add_row(row![
        r->"  Size:",
        format!("{} of {} bytes", memory.total_bytes, memory.budget_bytes)
    ]);
    table.add_row(row![r->"  Low memory:", memory.low_memory]);
    table.printstd();

    match &stats.cache.disk {
        Some(disk) => disk_table(disk).printstd(),
        None => println!("No disk cache configured"),
    }

    let loader = &stats.loader;
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row![b->"Loader", ""]);
    table.add_row(row![r->"  Workers busy:", loader.in_flight]);
    table.add_row(row![r->"  Queued:", loader.queued]);
    table.add_row(row![b->"Preload", ""]);
    table.add_row(row![r->"  Enabled:", stats.preload.enabled]);
    table.printstd();
    Ok(())
}
