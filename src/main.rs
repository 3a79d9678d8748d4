#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::cargo)]
#![warn(clippy::perf)]
#![warn(clippy::complexity)]
#![warn(clippy::style)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cargo_common_metadata)]

use std::{io::IsTerminal, path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{Result, ensure};
use chrono::Utc;
use clap::Parser;
use fetch::{HttpFetcher, RetryPolicy};
use merge::DedupPolicy;
use pipeline::{Config, Pipeline, RunReport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use util::{init_http_client, spawn_ct_watcher, warn_ulimit};
use validate::HttpProbe;
use writer::OutputLayout;

pub mod blacklist;
pub mod categorize;
pub mod channel;
pub mod fetch;
pub mod m3u;
pub mod merge;
pub mod pipeline;
pub mod pool;
pub mod sources;
pub mod util;
pub mod validate;
pub mod whitelist;
pub mod writer;

/// Collects upstream M3U playlists, keeps the streams that answer in time and
/// publishes them as one merged playlist plus one playlist per category
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Upstream playlist URLs, one per line
    #[arg(long, env = "TVC_SOURCES", default_value = "sources.txt")]
    sources: PathBuf,

    /// Slow / dead URLs skipped on every run, rewritten at the end of the run
    #[arg(long, env = "TVC_BLACKLIST", default_value = "blacklist.txt")]
    blacklist: PathBuf,

    /// Stream URL rules that are always published (optional file)
    #[arg(long, env = "TVC_WHITELIST", default_value = "whitelist.txt")]
    whitelist: PathBuf,

    /// Directory receiving the playlists and channel data
    #[arg(short, long, env = "TVC_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Publish playlists but leave the blacklist file untouched
    #[arg(long, env = "TVC_DRY_RUN")]
    dry_run: bool,

    /// Seconds before a playlist download is abandoned
    #[arg(long, env = "TVC_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Retries after a failed playlist download
    #[arg(long, env = "TVC_FETCH_RETRIES", default_value_t = 2)]
    fetch_retries: u32,

    /// Delay before the first retry in milliseconds, doubled for each following one
    #[arg(long, env = "TVC_FETCH_BACKOFF_MS", default_value_t = 500)]
    fetch_backoff_ms: u64,

    /// The amount of parallel playlist downloads
    #[arg(long, env = "TVC_FETCH_PARALLELISM", default_value_t = 8)]
    fetch_parallelism: usize,

    /// Milliseconds a stream gets to answer before it counts as slow and gets blacklisted
    #[arg(long, env = "TVC_PROBE_TIMEOUT_MS", default_value_t = 6000)]
    probe_timeout_ms: u64,

    /// The amount of parallel stream probes
    #[arg(long, env = "TVC_PROBE_PARALLELISM", default_value_t = 32)]
    probe_parallelism: usize,

    /// Publish every parsed stream without probing it
    #[arg(long, env = "TVC_NO_VALIDATE")]
    no_validate: bool,

    /// Neither read nor write the blacklist
    #[arg(long, env = "TVC_NO_BLACKLIST")]
    no_blacklist: bool,

    /// Blacklist a whole source once more than this share (0..1) of its streams failed
    #[arg(long, env = "TVC_SOURCE_FAILURE_RATIO")]
    source_failure_ratio: Option<f64>,

    /// Which entry survives when two sources list the same stream
    #[arg(long, env = "TVC_DEDUP_POLICY", value_enum, default_value_t = DedupPolicy::FirstSeen)]
    dedup_policy: DedupPolicy,

    /// Category of channels without a group
    #[arg(long, env = "TVC_DEFAULT_CATEGORY", default_value = channel::DEFAULT_CATEGORY)]
    default_category: String,
}

impl Args {
    fn into_config(self) -> Result<Config> {
        if let Some(ratio) = self.source_failure_ratio {
            ensure!(
                (0.0..=1.0).contains(&ratio),
                "--source-failure-ratio must be between 0 and 1, got {ratio}"
            );
        }
        ensure!(self.probe_timeout_ms > 0, "--probe-timeout-ms must be positive");

        Ok(Config {
            sources_path: self.sources,
            blacklist_path: self.blacklist,
            whitelist_path: self.whitelist,
            output: OutputLayout::new(self.output_dir),
            dry_run: self.dry_run,
            use_blacklist: !self.no_blacklist,
            validate: !self.no_validate,
            fetch_parallelism: self.fetch_parallelism,
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            probe_parallelism: self.probe_parallelism,
            source_failure_ratio: self.source_failure_ratio,
            dedup_policy: self.dedup_policy,
            default_category: self.default_category,
            show_progress: std::io::stderr().is_terminal(),
        })
    }

    const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            retries: self.fetch_retries,
            backoff: Duration::from_millis(self.fetch_backoff_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let retry_policy = args.retry_policy();
    let config = args.into_config()?;

    warn_ulimit(config.probe_parallelism);

    let client = init_http_client()?;
    let ct = CancellationToken::new();
    spawn_ct_watcher(ct.clone());

    info!("Collecting sources listed in {}", config.sources_path.display());
    let pipeline = Pipeline::new(
        HttpFetcher::new(client.clone(), retry_policy),
        HttpProbe::new(client),
        config,
    );

    let report = pipeline.run(&ct, Utc::now()).await?;
    log_summary(&report);

    if report.is_success() {
        info!("All done successfully!");
        Ok(ExitCode::SUCCESS)
    } else {
        error!("{} artifacts could not be written", report.writes.failed.len());
        Ok(ExitCode::FAILURE)
    }
}

fn log_summary(report: &RunReport) {
    info!(
        "Sources: {} used, {} failed",
        report.sources - report.failed_sources.len(),
        report.failed_sources.len()
    );
    for (source, reason) in &report.failed_sources {
        warn!("  {source}: {reason}");
    }
    info!(
        "Channels: {} parsed, {} from the whitelist, {} malformed entries dropped, {} blacklisted, {} duplicates",
        report.parsed_channels,
        report.whitelist_channels,
        report.parse_warnings,
        report.blacklisted_channels,
        report.duplicates
    );
    info!(
        "Streams: {} probed, {} failed",
        report.probed_streams, report.failed_streams
    );
    info!(
        "Published {} channels in {} categories",
        report.published_channels, report.categories
    );
    if !report.newly_blacklisted.is_empty() {
        info!("Newly blacklisted: {}", report.newly_blacklisted.len());
    }
}
