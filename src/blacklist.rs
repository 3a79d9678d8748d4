use std::{collections::HashSet, path::Path, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use crate::{
    channel::normalize_url,
    sources::read_optional_list,
    util::{format_timestamp, write_atomic},
};

/// Stream and source URLs excluded from future runs.
///
/// Entries are only ever added. File order is kept, new entries go to the end.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    entries: Vec<String>,
    index: HashSet<String>,
    /// Normalized keys of all entries, so rotating auth parameters do not dodge the list
    normalized: HashSet<String>,
}

impl Blacklist {
    pub fn from_entries<S: Into<String>>(entries: impl IntoIterator<Item = S>) -> Self {
        let mut blacklist = Self::default();
        blacklist.extend(entries);
        blacklist
    }

    /// # Errors
    /// Errors when the file exists but cannot be read
    #[instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let Some(lines) = read_optional_list(path)
            .await
            .with_context(|| format!("Reading blacklist {}", path.display()))?
        else {
            info!("{} does not exist yet, starting with an empty blacklist", path.display());
            return Ok(Self::default());
        };

        let blacklist = Self::from_entries(lines.into_iter().map(|l| l.value));
        info!("Loaded {} blacklist entries", blacklist.len());
        Ok(blacklist)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.contains(url)
    }

    /// Like [`Self::contains`], but also matches a stream URL that only differs from an
    /// entry in volatile query parameters
    pub fn contains_stream(&self, url: &str) -> bool {
        self.contains(url) || self.normalized.contains(&normalize_url(url))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Appends the URLs that are not listed yet, returning them in the order they were added
    pub fn extend<S: Into<String>>(&mut self, urls: impl IntoIterator<Item = S>) -> Vec<String> {
        let mut added = Vec::new();
        for url in urls {
            let url = url.into();
            if self.index.insert(url.clone()) {
                self.normalized.insert(normalize_url(&url));
                self.entries.push(url.clone());
                added.push(url);
            }
        }
        added
    }

    pub fn render(&self, slow_threshold: Duration, generated_at: DateTime<Utc>) -> String {
        let mut out = indoc::formatdoc!(
            "# Live stream blacklist
            # Streams that failed validation or took longer than {threshold} ms to respond,
            # and sources whose streams mostly failed.
            # One URL per line. Listed URLs are skipped on every following run.
            # Generated: {generated}

            ",
            threshold = slow_threshold.as_millis(),
            generated = format_timestamp(generated_at),
        );
        for url in &self.entries {
            out.push_str(url);
            out.push('\n');
        }
        out
    }

    /// # Errors
    /// Errors when the file cannot be written
    pub async fn save(
        &self,
        path: &Path,
        slow_threshold: Duration,
        generated_at: DateTime<Utc>,
    ) -> Result<()> {
        write_atomic(path, self.render(slow_threshold, generated_at))
            .await
            .context("Saving blacklist")
    }
}
