use std::{io::ErrorKind, path::Path};

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::blacklist::Blacklist;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Unable to read source list {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("No valid sources in {0}")]
    NoValidSources(String),
    #[error("None of the {0} sources could be fetched")]
    NoUsableSources(usize),
}

/// A single meaningful line of a list file, with its 1-based line number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListLine {
    pub number: usize,
    pub value: String,
}

/// Splits a user-editable list file into its meaningful lines.
/// Blank lines and `#` comments are skipped, everything else is trimmed.
pub fn parse_list(contents: &str) -> Vec<ListLine> {
    contents
        .lines()
        .enumerate()
        .filter_map(|(i, line)| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            Some(ListLine {
                number: i + 1,
                value: line.to_string(),
            })
        })
        .collect()
}

/// Reads a list file that is allowed to be absent. A missing file reads as empty.
///
/// # Errors
/// Errors on any IO error other than the file not existing
pub async fn read_optional_list(path: &Path) -> std::io::Result<Option<Vec<ListLine>>> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(parse_list(&contents))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Loads the upstream playlist URLs in file order, minus blacklisted ones.
///
/// # Errors
/// * [`SourceError::Read`] when the file cannot be read
/// * [`SourceError::NoValidSources`] when nothing usable remains after filtering
#[instrument(skip(blacklist))]
pub async fn load_sources(path: &Path, blacklist: &Blacklist) -> Result<Vec<String>, SourceError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| SourceError::Read {
            path: path.display().to_string(),
            source,
        })?;

    let mut sources = Vec::new();
    let mut skipped_blacklisted = 0;
    for line in parse_list(&contents) {
        if !(line.value.starts_with("http://") || line.value.starts_with("https://")) {
            warn!("Line {} is not an HTTP(S) URL, skipping: {}", line.number, line.value);
            continue;
        }
        if blacklist.contains(&line.value) {
            skipped_blacklisted += 1;
            continue;
        }
        if sources.contains(&line.value) {
            warn!("Line {} repeats an earlier source, skipping", line.number);
            continue;
        }
        sources.push(line.value);
    }

    if skipped_blacklisted > 0 {
        info!("Skipped {skipped_blacklisted} blacklisted sources");
    }
    if sources.is_empty() {
        return Err(SourceError::NoValidSources(path.display().to_string()));
    }

    info!("Loaded {} sources from {}", sources.len(), path.display());
    Ok(sources)
}
