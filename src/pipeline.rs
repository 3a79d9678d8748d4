use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    blacklist::Blacklist,
    categorize::categorize,
    channel::{ChannelEntry, DEFAULT_CATEGORY},
    fetch::{FetchError, PlaylistFetcher},
    m3u::parse_playlist,
    merge::{DedupPolicy, merge_channels},
    pool::run_indexed,
    sources::{SourceError, load_sources},
    validate::{StreamProbe, ValidationResult, Validator},
    whitelist::Whitelist,
    writer::{OutputLayout, WriteReport, write_snapshot},
};

#[derive(Debug, Clone)]
pub struct Config {
    pub sources_path: PathBuf,
    pub blacklist_path: PathBuf,
    pub whitelist_path: PathBuf,
    pub output: OutputLayout,
    pub dry_run: bool,
    pub use_blacklist: bool,
    pub validate: bool,
    pub fetch_parallelism: usize,
    pub probe_timeout: Duration,
    pub probe_parallelism: usize,
    /// Blacklist a whole source once more than this share of its probed streams failed
    pub source_failure_ratio: Option<f64>,
    pub dedup_policy: DedupPolicy,
    pub default_category: String,
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources_path: "sources.txt".into(),
            blacklist_path: "blacklist.txt".into(),
            whitelist_path: "whitelist.txt".into(),
            output: OutputLayout::new("."),
            dry_run: false,
            use_blacklist: true,
            validate: true,
            fetch_parallelism: 8,
            probe_timeout: Duration::from_millis(6000),
            probe_parallelism: 32,
            source_failure_ratio: None,
            dedup_policy: DedupPolicy::FirstSeen,
            default_category: DEFAULT_CATEGORY.to_string(),
            show_progress: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub sources: usize,
    pub failed_sources: Vec<(String, String)>,
    pub parsed_channels: usize,
    pub parse_warnings: usize,
    pub whitelist_channels: usize,
    pub blacklisted_channels: usize,
    pub probed_streams: usize,
    pub failed_streams: usize,
    pub duplicates: usize,
    pub published_channels: usize,
    pub categories: usize,
    pub newly_blacklisted: Vec<String>,
    pub writes: WriteReport,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.writes.is_success()
    }
}

/// One collection run: sources, fetch, parse, validate, merge, categorize, write
pub struct Pipeline<F, P> {
    fetcher: Arc<F>,
    probe: Arc<P>,
    config: Config,
}

impl<F, P> Pipeline<F, P>
where
    F: PlaylistFetcher + Send + Sync + 'static,
    P: StreamProbe + Send + Sync + 'static,
{
    pub fn new(fetcher: F, probe: P, config: Config) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            probe: Arc::new(probe),
            config,
        }
    }

    /// Runs the whole pipeline once.
    ///
    /// Nothing is written unless every stage before the writer completed.
    ///
    /// # Errors
    /// * No usable source, nothing is written
    /// * The blacklist or whitelist exists but cannot be read
    /// * `ct` got cancelled before writing started
    #[instrument(skip_all)]
    pub async fn run(&self, ct: &CancellationToken, generated_at: DateTime<Utc>) -> Result<RunReport> {
        let config = &self.config;
        let mut report = RunReport::default();

        let mut blacklist = if config.use_blacklist {
            let blacklist = Blacklist::load(&config.blacklist_path).await?;
            if blacklist.is_empty() {
                debug!("Starting with an empty blacklist");
            }
            blacklist
        } else {
            Blacklist::default()
        };
        let whitelist = Whitelist::load(&config.whitelist_path).await?;

        let sources = load_sources(&config.sources_path, &blacklist).await?;
        report.sources = sources.len();

        let playlists = self.fetch_all(ct, &sources).await?;

        let mut channels = Vec::new();
        for (source, fetched) in sources.iter().zip(playlists) {
            match fetched {
                Ok(text) => {
                    let parsed = parse_playlist(&text, source, &config.default_category);
                    for warning in &parsed.warnings {
                        debug!("{source}: {warning}");
                    }
                    if !parsed.warnings.is_empty() {
                        warn!("{source}: dropped {} malformed entries", parsed.warnings.len());
                    }
                    info!("{source}: {} channels", parsed.channels.len());
                    report.parse_warnings += parsed.warnings.len();
                    channels.extend(parsed.channels);
                }
                Err(e) => {
                    warn!("Skipping source {source}: {e}");
                    report.failed_sources.push((source.clone(), e.to_string()));
                }
            }
        }
        if report.failed_sources.len() == sources.len() {
            bail!(SourceError::NoUsableSources(sources.len()));
        }
        report.parsed_channels = channels.len();

        if !whitelist.channels().is_empty() {
            info!("Adding {} channels defined in the whitelist", whitelist.channels().len());
            channels.extend_from_slice(whitelist.channels());
        }
        report.whitelist_channels = whitelist.channels().len();

        let before = channels.len();
        channels.retain(|c| {
            whitelist.matches(&c.stream_url) || !blacklist.contains_stream(&c.stream_url)
        });
        report.blacklisted_channels = before - channels.len();
        if report.blacklisted_channels > 0 {
            info!("Dropped {} blacklisted channels", report.blacklisted_channels);
        }

        let (results, probed) = self.validate_all(ct, &channels, &whitelist).await?;
        report.probed_streams = probed;
        report.failed_streams = results.values().filter(|r| !r.ok).count();

        let slow = slow_urls(&channels, &results, &whitelist);
        let failing_sources = config
            .source_failure_ratio
            .map(|ratio| failing_sources(&channels, &results, &whitelist, ratio))
            .unwrap_or_default();

        let merged = merge_channels(
            channels,
            |c| results.get(&c.stream_url).is_none_or(|r| r.ok),
            config.dedup_policy,
        );
        report.duplicates = merged.duplicates;
        for rejected in &merged.rejected {
            debug!("Not publishing {} ({})", rejected.name, rejected.stream_url);
        }
        report.published_channels = merged.channels.len();

        let categories = categorize(&merged.channels, &config.default_category);
        report.categories = categories.len();
        if categories.is_empty() {
            warn!("No channel survived validation, publishing empty playlists");
        }

        if ct.is_cancelled() {
            bail!("Run cancelled before writing");
        }

        report.writes = write_snapshot(&config.output, &merged.channels, &categories, generated_at).await;

        report.newly_blacklisted = blacklist.extend(slow.into_iter().chain(failing_sources));
        if config.use_blacklist && !config.dry_run {
            let result = blacklist
                .save(&config.blacklist_path, config.probe_timeout, generated_at)
                .await;
            report.writes.record(config.blacklist_path.clone(), result);
        } else if !report.newly_blacklisted.is_empty() {
            info!(
                "Not saving {} new blacklist entries",
                report.newly_blacklisted.len()
            );
        }

        Ok(report)
    }

    /// Fetches every source, results in source order
    async fn fetch_all(
        &self,
        ct: &CancellationToken,
        sources: &[String],
    ) -> Result<Vec<Result<String, FetchError>>> {
        info!(
            "Fetching {} sources with {} parallelism",
            sources.len(),
            self.config.fetch_parallelism
        );

        run_indexed(ct, self.config.fetch_parallelism, sources.to_vec(), |url| {
            let fetcher = self.fetcher.clone();
            async move { fetcher.fetch(&url).await }
        })
        .await
        .context("Run cancelled while fetching sources")
    }

    async fn validate_all(
        &self,
        ct: &CancellationToken,
        channels: &[ChannelEntry],
        whitelist: &Whitelist,
    ) -> Result<(HashMap<String, ValidationResult>, usize)> {
        let mut validator = Validator::new(
            self.probe.clone(),
            self.config.probe_timeout,
            self.config.probe_parallelism,
            self.config.show_progress,
        );

        let mut to_probe = Vec::new();
        for channel in channels {
            let url = &channel.stream_url;
            if !self.config.validate || whitelist.matches(url) {
                validator.assume(ValidationResult::assumed_ok(url));
            } else {
                to_probe.push(url.clone());
            }
        }

        let probed = validator
            .validate(ct, &to_probe)
            .await
            .context("Run cancelled while validating streams")?;

        Ok((validator.into_results(), probed))
    }
}

/// Stream URLs that failed validation, in first-seen order
fn slow_urls(
    channels: &[ChannelEntry],
    results: &HashMap<String, ValidationResult>,
    whitelist: &Whitelist,
) -> Vec<String> {
    let mut seen = HashSet::new();
    channels
        .iter()
        .map(|c| &c.stream_url)
        .filter(|url| results.get(*url).is_some_and(|r| !r.ok))
        .filter(|url| !whitelist.matches(url))
        .filter(|url| seen.insert(url.as_str()))
        .cloned()
        .collect()
}

/// Sources whose share of failed streams exceeds `ratio`, in source order
fn failing_sources(
    channels: &[ChannelEntry],
    results: &HashMap<String, ValidationResult>,
    whitelist: &Whitelist,
    ratio: f64,
) -> Vec<String> {
    let mut order: Vec<&str> = Vec::new();
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for channel in channels {
        if whitelist.matches(&channel.stream_url) {
            continue;
        }
        let Some(result) = results.get(&channel.stream_url) else {
            continue;
        };
        let source = channel.source_url.as_str();
        let entry = counts.entry(source).or_insert_with(|| {
            order.push(source);
            (0, 0)
        });
        entry.0 += 1;
        if !result.ok {
            entry.1 += 1;
        }
    }

    order
        .into_iter()
        .filter(|source| {
            let (probed, failed) = counts[source];
            #[allow(clippy::cast_precision_loss)]
            let share = failed as f64 / probed as f64;
            share > ratio
        })
        .map(str::to_string)
        .collect()
}
