use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use rlimit::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Truncates a string to a maximum length, adding `...` to the end if it was truncated.
///
/// Keeps shrinking the cut point while it lands in the middle of a UTF-8 codepoint,
/// so log lines with CJK channel names stay valid.
pub fn truncate_string(string: &impl ToString, max_length: usize) -> String {
    let string = string.to_string();
    if string.len() <= max_length || max_length < 3 {
        return string;
    }

    let mut attempted_len = max_length - 3;
    while !string.is_char_boundary(attempted_len) {
        attempted_len -= 1;
    }

    format!("{}...", &string[..attempted_len])
}

/// Warns when the open file limit is too low for the amount of concurrent probes.
/// Every in-flight probe holds a socket.
pub fn warn_ulimit(probe_parallelism: usize) {
    let Ok((limit, _)) = rlimit::getrlimit(Resource::NOFILE) else {
        debug!("Unable to read the open file limit");
        return;
    };

    if limit <= (probe_parallelism as u64).saturating_mul(4).max(1024) {
        warn!(
            "Your file limit ({limit}) is low for {probe_parallelism} concurrent probes. Consider raising it via `ulimit -n 10240`"
        );
    }
}

/// Builds the shared HTTP client. Request timeouts are set per request by the callers.
///
/// # Errors
/// Errors when the TLS backend cannot be initialized
pub fn init_http_client() -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "User-Agent",
        HeaderValue::from_str(&format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        ))
        .context("Building User-Agent header")?,
    );
    headers.insert(
        "Accept",
        HeaderValue::from_static("application/x-mpegURL,text/plain,*/*"),
    );

    reqwest::Client::builder()
        .default_headers(headers)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("Building HTTP client")
}

/// Spawn a task that watches for CTRL + C signal and cancels a [`CancellationToken`] when caught
pub fn spawn_ct_watcher(ct: CancellationToken) {
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Caught CTRL+C signal!");
        ct.cancel();
    });
}

/// Timestamp format used in the comment headers of published files
#[must_use]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Writes `contents` next to `path` first, then renames it into place.
///
/// Readers of `path` only ever see the previous file or the complete new one.
///
/// # Errors
/// Errors when the parent directory cannot be created, or the write / rename fails
pub async fn write_atomic(path: &Path, contents: impl AsRef<[u8]>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Creating directory {}", parent.display()))?;
    }

    let temp_path = temp_path_for(path);
    if let Err(e) = tokio::fs::write(&temp_path, contents).await {
        remove_if_exists(&temp_path).await;
        return Err(e).with_context(|| format!("Writing {}", temp_path.display()));
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        remove_if_exists(&temp_path).await;
        return Err(e).with_context(|| format!("Moving {} into place", path.display()));
    }

    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map_or_else(|| "output".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()))
}

async fn remove_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Unable to remove temporary file {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_string(&"CNN", 10), "CNN");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        // Each CJK character is 3 bytes long
        let truncated = truncate_string(&"中央电视台综合频道", 10);
        assert_eq!(truncated, "中央...");
    }

    #[test]
    fn timestamp_format() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(format_timestamp(at), "2026-01-02 03:04:05 UTC");
    }

    #[tokio::test]
    async fn atomic_write_replaces_file_and_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/live_sources.m3u");

        write_atomic(&path, "first").await.unwrap();
        write_atomic(&path, "second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn atomic_write_into_missing_parent_that_is_a_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("categories");
        std::fs::write(&blocker, "not a directory").unwrap();

        let result = write_atomic(&blocker.join("News.m3u"), "x").await;
        assert!(result.is_err());
    }
}
