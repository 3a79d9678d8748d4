use std::{fmt::Write as _, sync::LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::{
    channel::{ChannelEntry, DEFAULT_CATEGORY},
    util::format_timestamp,
};

static ATTRIBUTE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([A-Za-z0-9_-]+)="([^"]*)""#).unwrap());

const UNKNOWN_CHANNEL_NAME: &str = "Unknown Channel";

/// Recoverable problems found while parsing an upstream playlist
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseWarning {
    #[error("#EXTINF on line {0} is not followed by a stream URL")]
    MissingUrl(usize),
    #[error("Stream URL on line {0} has no preceding #EXTINF")]
    OrphanUrl(usize),
}

#[derive(Debug, Default)]
pub struct ParseReport {
    pub channels: Vec<ChannelEntry>,
    pub warnings: Vec<ParseWarning>,
}

#[derive(Debug)]
struct PendingInfo {
    line: usize,
    name: String,
    group: Option<String>,
    logo: Option<String>,
}

/// Parses an (extended) M3U playlist into channels, best effort.
///
/// Entries without a stream URL and URLs without an `#EXTINF` are dropped and reported.
pub fn parse_playlist(text: &str, source_url: &str, default_category: &str) -> ParseReport {
    let mut report = ParseReport::default();
    let mut pending: Option<PendingInfo> = None;

    for (i, line) in text.lines().enumerate() {
        let line_number = i + 1;
        let line = line.trim().trim_start_matches('\u{feff}');
        if line.is_empty() {
            continue;
        }

        if let Some(info) = line.strip_prefix("#EXTINF:") {
            if let Some(previous) = pending.take() {
                report.warnings.push(ParseWarning::MissingUrl(previous.line));
            }
            pending = Some(parse_extinf(info, line_number));
            continue;
        }

        if let Some(group) = line.strip_prefix("#EXTGRP:") {
            if let Some(info) = pending.as_mut().filter(|p| p.group.is_none()) {
                info.group = non_empty(group);
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let Some(info) = pending.take() else {
            report.warnings.push(ParseWarning::OrphanUrl(line_number));
            continue;
        };

        report.channels.push(ChannelEntry {
            name: info.name,
            category: info.group.unwrap_or_else(|| default_category.to_string()),
            stream_url: line.to_string(),
            logo_url: info.logo,
            source_url: source_url.to_string(),
        });
    }

    if let Some(previous) = pending {
        report.warnings.push(ParseWarning::MissingUrl(previous.line));
    }

    report
}

fn parse_extinf(info: &str, line: usize) -> PendingInfo {
    let (attributes, title) = split_title(info);

    let mut group = None;
    let mut logo = None;
    let mut tvg_name = None;
    for capture in ATTRIBUTE_REGEX.captures_iter(attributes) {
        let value = non_empty(&capture[2]);
        match capture[1].to_ascii_lowercase().as_str() {
            "group-title" => group = value,
            "tvg-logo" => logo = value,
            "tvg-name" => tvg_name = value,
            _ => {}
        }
    }

    let name = non_empty(title)
        .or(tvg_name)
        .unwrap_or_else(|| UNKNOWN_CHANNEL_NAME.to_string());

    PendingInfo {
        line,
        name,
        group,
        logo,
    }
}

/// Splits `-1 key="v, w",Title, With Commas` at the first comma outside quotes
fn split_title(info: &str) -> (&str, &str) {
    let mut in_quotes = false;
    for (i, c) in info.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => return (&info[..i], &info[i + 1..]),
            _ => {}
        }
    }
    (info, "")
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Attribute values cannot contain quotes, and the title cannot span lines
fn sanitize_attribute(value: &str) -> String {
    value.replace('"', "'").replace(['\r', '\n'], " ")
}

/// Serializes channels into an extended M3U playlist
pub fn render_playlist<'a>(
    channels: impl ExactSizeIterator<Item = &'a ChannelEntry>,
    generated_at: DateTime<Utc>,
) -> String {
    let mut out = String::from("#EXTM3U\n");
    // Writing into a String never fails
    let _ = writeln!(out, "# Generated: {}", format_timestamp(generated_at));
    let _ = writeln!(out, "# Channels: {}", channels.len());

    for channel in channels {
        let category = if channel.category.trim().is_empty() {
            DEFAULT_CATEGORY
        } else {
            channel.category.as_str()
        };

        let _ = write!(
            out,
            "#EXTINF:-1 group-title=\"{}\"",
            sanitize_attribute(category)
        );
        if let Some(logo) = &channel.logo_url {
            let _ = write!(out, " tvg-logo=\"{}\"", sanitize_attribute(logo));
        }
        let _ = writeln!(out, ",{}", channel.name.replace(['\r', '\n'], " "));
        let _ = writeln!(out, "{}", channel.stream_url);
    }

    out
}
