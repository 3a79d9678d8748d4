use std::{collections::HashSet, path::Path};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::{channel::ChannelEntry, sources::read_optional_list};

/// `sourceURL` of channels defined in the whitelist itself
pub const WHITELIST_SOURCE: &str = "whitelist";
const DEFINED_CHANNEL_NAME: &str = "Whitelisted Channel";
const DEFINED_CHANNEL_CATEGORY: &str = "Whitelist";

/// Streams that are always published, regardless of blacklist or probe results.
///
/// Rules, one per line:
/// * `url=<stream>, name=<name>, group=<category>, logo=<logo>` defines a channel that is
///   published even when no source lists it, and whitelists its stream URL
/// * a full URL, matched exactly
/// * `*text*`, matched as a substring
/// * `/regex/`, matched against the lower-cased URL
/// * anything else, matched as a case-insensitive substring
#[derive(Debug, Default)]
pub struct Whitelist {
    urls: HashSet<String>,
    substrings: Vec<String>,
    patterns: Vec<Regex>,
    channels: Vec<ChannelEntry>,
}

impl Whitelist {
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a str>) -> Self {
        let mut whitelist = Self::default();
        for rule in rules {
            whitelist.add_rule(rule);
        }
        whitelist
    }

    /// # Errors
    /// Errors when the file exists but cannot be read
    #[instrument]
    pub async fn load(path: &Path) -> Result<Self> {
        let Some(lines) = read_optional_list(path)
            .await
            .with_context(|| format!("Reading whitelist {}", path.display()))?
        else {
            return Ok(Self::default());
        };

        let whitelist = Self::from_rules(lines.iter().map(|l| l.value.as_str()));
        info!(
            "Loaded whitelist: {} URLs, {} substrings, {} patterns, {} defined channels",
            whitelist.urls.len(),
            whitelist.substrings.len(),
            whitelist.patterns.len(),
            whitelist.channels.len()
        );
        Ok(whitelist)
    }

    fn add_rule(&mut self, rule: &str) {
        if rule.starts_with("url=") {
            match parse_channel_definition(rule) {
                Some(channel) => {
                    self.urls.insert(channel.stream_url.clone());
                    self.channels.push(channel);
                }
                None => warn!("Ignoring whitelist channel without a stream URL: {rule}"),
            }
        } else if rule.starts_with("http://") || rule.starts_with("https://") {
            self.urls.insert(rule.to_string());
        } else if let Some(inner) = rule
            .strip_prefix('*')
            .and_then(|r| r.strip_suffix('*'))
            .filter(|r| !r.is_empty())
        {
            self.substrings.push(inner.to_lowercase());
        } else if let Some(inner) = rule
            .strip_prefix('/')
            .and_then(|r| r.strip_suffix('/'))
            .filter(|r| !r.is_empty())
        {
            match Regex::new(inner) {
                Ok(re) => self.patterns.push(re),
                Err(e) => warn!("Ignoring invalid whitelist pattern {rule}: {e}"),
            }
        } else {
            self.substrings.push(rule.to_lowercase());
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.substrings.is_empty() && self.patterns.is_empty()
    }

    /// Channels defined by `url=` rules, in file order
    pub fn channels(&self) -> &[ChannelEntry] {
        &self.channels
    }

    pub fn matches(&self, url: &str) -> bool {
        if self.urls.contains(url) {
            return true;
        }
        if self.substrings.is_empty() && self.patterns.is_empty() {
            return false;
        }

        let lower = url.to_lowercase();
        self.substrings.iter().any(|s| lower.contains(s.as_str()))
            || self.patterns.iter().any(|re| re.is_match(&lower))
    }
}

/// Parses `url=..., name=..., group=..., logo=...`; keys may come in any order
fn parse_channel_definition(rule: &str) -> Option<ChannelEntry> {
    let mut url = None;
    let mut name = None;
    let mut group = None;
    let mut logo = None;
    for part in rule.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "url" => url = Some(value),
            "name" => name = Some(value),
            "group" => group = Some(value),
            "logo" => logo = Some(value),
            _ => {}
        }
    }

    Some(ChannelEntry {
        name: name.unwrap_or(DEFINED_CHANNEL_NAME).to_string(),
        category: group.unwrap_or(DEFINED_CHANNEL_CATEGORY).to_string(),
        stream_url: url?.to_string(),
        logo_url: logo.map(str::to_string),
        source_url: WHITELIST_SOURCE.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_kinds() {
        let whitelist = Whitelist::from_rules([
            "http://exact.test/live.m3u8",
            "*TrustedCDN*",
            r"/^https?://\d+\.\d+\.\d+\.\d+/",
            "Stable-Host",
        ]);

        assert!(whitelist.matches("http://exact.test/live.m3u8"));
        assert!(!whitelist.matches("http://exact.test/other.m3u8"));
        assert!(whitelist.matches("http://edge.trustedcdn.net/a.m3u8"));
        assert!(whitelist.matches("http://10.0.0.1/stream"));
        assert!(whitelist.matches("http://STABLE-HOST.example/x"));
        assert!(!whitelist.matches("http://random.test/x"));
    }

    #[test]
    fn channel_definitions_define_and_whitelist_streams() {
        let whitelist = Whitelist::from_rules([
            "url=http://w.test/live.m3u8, name=Pinned, group=Fav, logo=http://w.test/p.png",
            "url=http://w.test/bare.m3u8",
            "url=, name=Nothing",
        ]);

        assert!(whitelist.matches("http://w.test/live.m3u8"));
        assert!(whitelist.matches("http://w.test/bare.m3u8"));
        assert!(!whitelist.matches("http://w.test/other.m3u8"));
        assert_eq!(
            whitelist.channels(),
            [
                ChannelEntry {
                    name: "Pinned".into(),
                    category: "Fav".into(),
                    stream_url: "http://w.test/live.m3u8".into(),
                    logo_url: Some("http://w.test/p.png".into()),
                    source_url: WHITELIST_SOURCE.into(),
                },
                ChannelEntry {
                    name: DEFINED_CHANNEL_NAME.into(),
                    category: DEFINED_CHANNEL_CATEGORY.into(),
                    stream_url: "http://w.test/bare.m3u8".into(),
                    logo_url: None,
                    source_url: WHITELIST_SOURCE.into(),
                },
            ]
        );
    }

    #[test]
    fn invalid_pattern_is_ignored() {
        let whitelist = Whitelist::from_rules(["/([/"]);
        assert!(whitelist.is_empty());
        assert!(!whitelist.matches("http://a.test/"));
    }
}
