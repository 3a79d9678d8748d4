use std::{
    collections::HashSet,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tracing::{error, info, instrument, warn};

use crate::{
    categorize::{Categories, category_file_stem},
    channel::ChannelEntry,
    m3u::render_playlist,
    util::write_atomic,
};

pub const PLAYLIST_FILE: &str = "live_sources.m3u";
pub const CHANNELS_FILE: &str = "channels.json";
pub const CATEGORIES_DIR: &str = "categories";

#[derive(Debug, Clone)]
pub struct OutputLayout {
    pub dir: PathBuf,
}

impl OutputLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn playlist(&self) -> PathBuf {
        self.dir.join(PLAYLIST_FILE)
    }

    pub fn channels_json(&self) -> PathBuf {
        self.dir.join(CHANNELS_FILE)
    }

    pub fn categories_dir(&self) -> PathBuf {
        self.dir.join(CATEGORIES_DIR)
    }
}

/// Which artifacts made it to disk. One failing artifact never stops the others.
#[derive(Debug, Default)]
pub struct WriteReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, anyhow::Error)>,
}

impl WriteReport {
    pub fn record(&mut self, path: PathBuf, result: Result<()>) {
        match result {
            Ok(()) => self.written.push(path),
            Err(e) => {
                error!("Failed to write {}: {e:#}", path.display());
                self.failed.push((path, e));
            }
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Gives every category its own file name, even when two names sanitize to the same stem
fn category_paths<'a>(dir: &Path, categories: &Categories<'a>) -> Vec<(&'a str, PathBuf)> {
    let mut used = HashSet::new();
    categories
        .iter()
        .map(|(category, _)| {
            let stem = category_file_stem(category);
            let mut candidate = stem.clone();
            let mut n = 2;
            while !used.insert(candidate.to_lowercase()) {
                candidate = format!("{stem}-{n}");
                n += 1;
            }
            (category, dir.join(format!("{candidate}.m3u")))
        })
        .collect()
}

/// Writes the full playlist, the JSON dump and one playlist per category
#[instrument(skip_all, fields(dir = %layout.dir.display(), channels = channels.len()))]
pub async fn write_snapshot(
    layout: &OutputLayout,
    channels: &[ChannelEntry],
    categories: &Categories<'_>,
    generated_at: DateTime<Utc>,
) -> WriteReport {
    let mut report = WriteReport::default();

    let playlist = render_playlist(channels.iter(), generated_at);
    let path = layout.playlist();
    let result = write_atomic(&path, playlist).await;
    report.record(path, result);

    let path = layout.channels_json();
    let result = match serde_json::to_string_pretty(channels) {
        Ok(mut json) => {
            json.push('\n');
            write_atomic(&path, json).await
        }
        Err(e) => Err(e).context("Serializing channels"),
    };
    report.record(path, result);

    let dir = layout.categories_dir();
    let targets = category_paths(&dir, categories);
    let writes = categories.iter().zip(&targets).map(|((_, members), (_, path))| {
        let contents = render_playlist(members.iter().copied(), generated_at);
        async move { write_atomic(path, contents).await }
    });
    let results = join_all(writes).await;
    for ((_, path), result) in targets.iter().zip(results) {
        report.record(path.clone(), result);
    }

    let keep: HashSet<PathBuf> = targets.into_iter().map(|(_, path)| path).collect();
    remove_stale_categories(&dir, &keep).await;

    info!(
        "Wrote {} artifacts, {} failed",
        report.written.len(),
        report.failed.len()
    );
    report
}

/// Removes category playlists of categories that no longer exist
async fn remove_stale_categories(dir: &Path, keep: &HashSet<PathBuf>) {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return,
        Err(e) => {
            warn!("Unable to list {}: {e}", dir.display());
            return;
        }
    };

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!("Unable to list {}: {e}", dir.display());
                break;
            }
        };

        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "m3u") || keep.contains(&path) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!("Removed stale category playlist {}", path.display()),
            Err(e) => warn!("Unable to remove {}: {e}", path.display()),
        }
    }
}
