use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::download::batch::DownloadStrategy;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "assetcache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Budgets of the cache tiers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of bytes held by decoded objects in memory.
    pub memory_budget: u64,
    /// Maximum number of bytes of blobs stored on disk.
    pub disk_budget: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget: 64 * 1024 * 1024,
            disk_budget: 256 * 1024 * 1024,
        }
    }
}

/// Fine-tuning of the priority loader.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoaderConfig {
    /// The number of fetches running concurrently.
    pub max_workers: usize,

    /// The timeout for establishing a connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The timeout for reading the response.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,

    /// How often a retryable failure is retried within one load.
    pub max_retries: u32,

    /// The delay before the first retry. It doubles with every further retry.
    #[serde(with = "humantime_serde")]
    pub initial_retry_delay: Duration,

    /// The upper bound for the delay between retries.
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,

    /// How long a failed load is reported to further loads of the same key before it is fetched
    /// again.
    #[serde(with = "humantime_serde")]
    pub error_ttl: Duration,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(8),
            error_ttl: Duration::from_millis(500),
        }
    }
}

impl LoaderConfig {
    /// The upper bound for a single fetch attempt.
    pub fn fetch_timeout(&self) -> Duration {
        self.connect_timeout + self.read_timeout
    }
}

/// Fine-tuning of speculative preloading.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PreloadConfig {
    /// Whether preloading starts out enabled.
    pub enabled: bool,

    /// The maximum number of concurrently scheduled preloads.
    pub max_sessions: usize,

    /// How long an accepted preload waits before it is submitted to the loader.
    #[serde(with = "humantime_serde")]
    pub quiescence: Duration,

    /// Preloads are rejected while the memory tier is filled above this percentage.
    pub high_water_mark_percent: u8,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_sessions: 5,
            quiescence: Duration::from_secs(2),
            high_water_mark_percent: 80,
        }
    }
}

/// Fine-tuning of batch downloads.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DownloadConfig {
    /// Which items of a batch are admitted.
    pub strategy: DownloadStrategy,

    /// The maximum number of batch items in flight, across all batches.
    pub max_concurrent: usize,

    /// Items with a known size above this are considered large by the `smart` strategy.
    pub smart_size_threshold: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            strategy: DownloadStrategy::Smart,
            max_concurrent: 3,
            smart_size_threshold: 10 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk tier. Default is memory-only operation.
    pub cache_dir: Option<PathBuf>,

    /// Budgets of the cache tiers.
    pub caches: CacheConfig,

    /// Configuration of the priority loader.
    pub loader: LoaderConfig,

    /// Configuration of speculative preloading.
    pub preload: PreloadConfig,

    /// Configuration of batch downloads.
    pub download: DownloadConfig,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        let config: Self = serde_yaml::from_str(&config).context("failed to parse config YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the components cannot operate with.
    fn validate(&self) -> Result<()> {
        if self.loader.max_workers == 0 {
            anyhow::bail!("loader.max_workers must be at least 1");
        }
        if self.download.max_concurrent == 0 {
            anyhow::bail!("download.max_concurrent must be at least 1");
        }
        if self.preload.high_water_mark_percent > 100 {
            anyhow::bail!("preload.high_water_mark_percent must not exceed 100");
        }
        if self.loader.initial_retry_delay > self.loader.max_retry_delay {
            anyhow::bail!("loader.initial_retry_delay must not exceed loader.max_retry_delay");
        }
        Ok(())
    }
}

/// Accepts `off`, `error`, `warn`, `info`, `debug` and `trace`.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(|_| {
        de::Error::invalid_value(
            de::Unexpected::Str(&level),
            &"one of off, error, warn, info, debug or trace",
        )
    })
}
