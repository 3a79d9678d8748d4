use reqwest::Url;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CATEGORY: &str = "Uncategorized";

/// Query parameters that carry per-request auth or cache busting.
/// Two URLs differing only in these point at the same stream.
const VOLATILE_QUERY_KEYS: &[&str] = &[
    "token",
    "t",
    "ts",
    "timestamp",
    "wssecret",
    "wstime",
    "auth_key",
    "sign",
    "signature",
    "expires",
    "e",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    pub category: String,
    #[serde(rename = "streamURL")]
    pub stream_url: String,
    #[serde(rename = "logoURL")]
    pub logo_url: Option<String>,
    #[serde(rename = "sourceURL")]
    pub source_url: String,
}

impl ChannelEntry {
    pub fn normalized_url(&self) -> String {
        normalize_url(&self.stream_url)
    }
}

/// Deduplication key of a stream URL.
///
/// Scheme and host are lower-cased and default ports dropped (both done by [`Url`]),
/// the fragment and volatile auth parameters are removed. Unparseable URLs key on their
/// trimmed text.
pub fn normalize_url(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_string();
    };

    url.set_fragment(None);

    if url.query().is_some() {
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !VOLATILE_QUERY_KEYS.contains(&k.to_ascii_lowercase().as_str()))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if kept.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(kept);
        }
    }

    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_ignores_case_port_fragment_and_tokens() {
        let a = normalize_url("HTTP://A.Test:80/live/cnn.m3u8?token=abc&ch=1#frag");
        let b = normalize_url("http://a.test/live/cnn.m3u8?ch=1&wsTime=123");
        assert_eq!(a, b);
        assert_eq!(a, "http://a.test/live/cnn.m3u8?ch=1");
    }

    #[test]
    fn normalization_drops_query_when_only_volatile_keys() {
        assert_eq!(
            normalize_url("https://a.test/x.m3u8?t=1&sign=2"),
            "https://a.test/x.m3u8"
        );
    }

    #[test]
    fn normalization_keeps_relevant_query_and_path_case() {
        assert_ne!(
            normalize_url("http://a.test/Live?id=1"),
            normalize_url("http://a.test/live?id=1")
        );
        assert_ne!(
            normalize_url("http://a.test/live?id=1"),
            normalize_url("http://a.test/live?id=2")
        );
    }

    #[test]
    fn unparseable_urls_key_on_trimmed_text() {
        assert_eq!(normalize_url("  not a url "), "not a url");
    }

    #[test]
    fn json_field_names() {
        let channel = ChannelEntry {
            name: "CNN".into(),
            category: "News".into(),
            stream_url: "http://a.test/cnn.m3u8".into(),
            logo_url: None,
            source_url: "http://src.test/list.m3u".into(),
        };

        let json = serde_json::to_value(&channel).unwrap();
        assert_eq!(json["streamURL"], "http://a.test/cnn.m3u8");
        assert_eq!(json["sourceURL"], "http://src.test/list.m3u");
        assert!(json["logoURL"].is_null());
        assert_eq!(json["category"], "News");
    }
}
