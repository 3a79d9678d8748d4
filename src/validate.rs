use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{
    StatusCode,
    header::{CONTENT_TYPE, RANGE},
};
use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::{pool::run_indexed, util::truncate_string};

/// Bytes requested from a stream to prove it is alive
const PROBE_PREFIX_BYTES: usize = 10 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeFailure {
    #[error("No response within the time budget")]
    Timeout,
    #[error("HTTP {0}")]
    Http(StatusCode),
    #[error("Network error: {0}")]
    Network(String),
    #[error("Response is not a valid HLS playlist")]
    InvalidPlaylist,
}

impl From<reqwest::Error> for ProbeFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(status) = e.status() {
            Self::Http(status)
        } else {
            Self::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub stream_url: String,
    pub response_time_ms: u64,
    pub ok: bool,
    pub failure: Option<ProbeFailure>,
}

impl ValidationResult {
    /// Result for streams that are trusted without probing
    pub fn assumed_ok(stream_url: &str) -> Self {
        Self {
            stream_url: stream_url.to_string(),
            response_time_ms: 0,
            ok: true,
            failure: None,
        }
    }
}

/// Checks whether a stream URL answers like a live stream
pub trait StreamProbe {
    fn probe(&self, url: &str) -> impl Future<Output = Result<(), ProbeFailure>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Reads at most [`PROBE_PREFIX_BYTES`] of the body
    async fn read_prefix(&self, url: &str) -> Result<(Vec<u8>, Option<String>), ProbeFailure> {
        let res = self
            .client
            .get(url)
            .header(RANGE, format!("bytes=0-{}", PROBE_PREFIX_BYTES - 1))
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(ProbeFailure::Http(status));
        }
        let content_type = res
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_ascii_lowercase);

        let mut prefix = Vec::new();
        let mut stream = res.bytes_stream();
        while let Some(chunk) = stream.next().await {
            prefix.extend_from_slice(&chunk?);
            if prefix.len() >= PROBE_PREFIX_BYTES {
                prefix.truncate(PROBE_PREFIX_BYTES);
                break;
            }
        }

        Ok((prefix, content_type))
    }
}

fn is_hls_url(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.to_ascii_lowercase().ends_with(".m3u8")
}

impl StreamProbe for HttpProbe {
    #[instrument(skip(self))]
    async fn probe(&self, url: &str) -> Result<(), ProbeFailure> {
        if is_hls_url(url) {
            let (prefix, _) = self.read_prefix(url).await?;
            return match m3u8_rs::parse_playlist_res(&prefix) {
                Ok(_) => Ok(()),
                Err(_) => Err(ProbeFailure::InvalidPlaylist),
            };
        }

        match self.client.head(url).send().await {
            Ok(res) if res.status().is_success() => return Ok(()),
            Ok(res) => debug!("HEAD answered {}, retrying with GET", res.status()),
            Err(e) => debug!("HEAD failed ({e}), retrying with GET"),
        }

        let (prefix, content_type) = self.read_prefix(url).await?;
        if prefix.is_empty() {
            return Err(ProbeFailure::Network(format!(
                "Empty response body ({})",
                content_type.as_deref().unwrap_or("no content type")
            )));
        }
        Ok(())
    }
}

/// Probes stream URLs with a hard time budget per URL.
///
/// Results are remembered for the whole run, a URL is never probed twice.
#[derive(Debug)]
pub struct Validator<P> {
    probe: Arc<P>,
    budget: Duration,
    parallelism: usize,
    show_progress: bool,
    known: HashMap<String, ValidationResult>,
}

impl<P> Validator<P>
where
    P: StreamProbe + Send + Sync + 'static,
{
    pub fn new(probe: Arc<P>, budget: Duration, parallelism: usize, show_progress: bool) -> Self {
        Self {
            probe,
            budget,
            parallelism,
            show_progress,
            known: HashMap::new(),
        }
    }

    /// Records a result without probing, e.g. for whitelisted streams
    pub fn assume(&mut self, result: ValidationResult) {
        self.known.entry(result.stream_url.clone()).or_insert(result);
    }

    #[cfg(test)]
    pub fn result(&self, url: &str) -> Option<&ValidationResult> {
        self.known.get(url)
    }

    pub fn into_results(self) -> HashMap<String, ValidationResult> {
        self.known
    }

    /// Probes every URL without a known result, returning how many were probed.
    /// Returns `None` when cancelled.
    #[instrument(skip_all, fields(urls = urls.len()))]
    pub async fn validate(&mut self, ct: &CancellationToken, urls: &[String]) -> Option<usize> {
        let mut seen: HashSet<&str> = HashSet::new();
        let pending: Vec<String> = urls
            .iter()
            .filter(|url| !self.known.contains_key(url.as_str()) && seen.insert(url.as_str()))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Some(0);
        }
        let probed = pending.len();

        info!(
            "Probing {} streams with {} parallelism",
            pending.len(),
            self.parallelism
        );
        let pb = self.progress_bar(pending.len() as u64);

        let budget = self.budget;
        let results = run_indexed(ct, self.parallelism, pending, |url| {
            let probe = self.probe.clone();
            let pb = pb.clone();
            async move {
                let result = probe_within(probe.as_ref(), url, budget).await;
                pb.inc(1);
                result
            }
        })
        .await;
        pb.finish_and_clear();

        for result in results? {
            match &result.failure {
                None => debug!(
                    "OK in {}ms: {}",
                    result.response_time_ms,
                    truncate_string(&result.stream_url, 80)
                ),
                Some(failure) => debug!(
                    "Failed after {}ms ({failure}): {}",
                    result.response_time_ms,
                    truncate_string(&result.stream_url, 80)
                ),
            }
            self.known.insert(result.stream_url.clone(), result);
        }

        Some(probed)
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} streams ({eta})",
        ) {
            pb.set_style(style);
        }
        pb
    }
}

async fn probe_within<P: StreamProbe>(probe: &P, url: String, budget: Duration) -> ValidationResult {
    let started = Instant::now();
    let outcome = tokio::time::timeout(budget, probe.probe(&url)).await;
    let elapsed = started.elapsed();

    let failure = match outcome {
        Ok(Ok(())) if elapsed <= budget => None,
        Ok(Ok(())) | Err(_) => Some(ProbeFailure::Timeout),
        Ok(Err(e)) => Some(e),
    };

    ValidationResult {
        stream_url: url,
        response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        ok: failure.is_none(),
        failure,
    }
}
