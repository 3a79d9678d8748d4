use std::collections::HashMap;

use clap::ValueEnum;
use tracing::debug;

use crate::channel::ChannelEntry;

/// Which entry survives when two channels share a normalized stream URL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum DedupPolicy {
    /// Keep the first-seen entry unless a later one validated and it did not
    #[default]
    FirstSeen,
    /// Let a later entry replace an earlier one unless the later one is worse
    LatestWins,
}

impl DedupPolicy {
    const fn replaces(self, existing_ok: bool, candidate_ok: bool) -> bool {
        match self {
            Self::FirstSeen => !existing_ok && candidate_ok,
            Self::LatestWins => candidate_ok || !existing_ok,
        }
    }
}

#[derive(Debug, Default)]
pub struct MergeOutcome {
    /// Usable channels, one per normalized stream URL, in first-seen order
    pub channels: Vec<ChannelEntry>,
    /// Channels that lost a collision
    pub duplicates: usize,
    /// Distinct channels dropped because they failed validation
    pub rejected: Vec<ChannelEntry>,
}

/// Merges channels from all sources into one list keyed by normalized stream URL.
///
/// A replacing entry takes over the slot of the entry it replaces, so the output order
/// only depends on the input order.
pub fn merge_channels(
    channels: impl IntoIterator<Item = ChannelEntry>,
    is_ok: impl Fn(&ChannelEntry) -> bool,
    policy: DedupPolicy,
) -> MergeOutcome {
    let mut slots: Vec<(ChannelEntry, bool)> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut duplicates = 0;

    for channel in channels {
        let ok = is_ok(&channel);
        let key = channel.normalized_url();

        match by_key.get(&key) {
            Some(&slot) => {
                duplicates += 1;
                let (existing, existing_ok) = &mut slots[slot];
                if policy.replaces(*existing_ok, ok) {
                    debug!(
                        "{} from {} replaces the entry from {}",
                        channel.name, channel.source_url, existing.source_url
                    );
                    *existing = channel;
                    *existing_ok = ok;
                }
            }
            None => {
                by_key.insert(key, slots.len());
                slots.push((channel, ok));
            }
        }
    }

    let mut outcome = MergeOutcome {
        duplicates,
        ..MergeOutcome::default()
    };
    for (channel, ok) in slots {
        if ok {
            outcome.channels.push(channel);
        } else {
            outcome.rejected.push(channel);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(name: &str, url: &str, source: &str) -> ChannelEntry {
        ChannelEntry {
            name: name.into(),
            category: "News".into(),
            stream_url: url.into(),
            logo_url: None,
            source_url: source.into(),
        }
    }

    #[test]
    fn same_normalized_url_collapses_to_one_entry() {
        let outcome = merge_channels(
            [
                channel("CNN", "http://a.test/cnn.m3u8?token=1", "s1"),
                channel("CNN HD", "HTTP://A.TEST/cnn.m3u8?token=2", "s2"),
                channel("BBC", "http://a.test/bbc.m3u8", "s2"),
            ],
            |_| true,
            DedupPolicy::FirstSeen,
        );

        assert_eq!(outcome.duplicates, 1);
        let names: Vec<_> = outcome.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["CNN", "BBC"]);
        assert_eq!(outcome.channels[0].source_url, "s1");
    }

    #[test]
    fn better_validation_replaces_in_place() {
        // Same URL key, only the entry from s2 is deemed ok
        let outcome = merge_channels(
            [
                channel("CNN", "http://a.test/cnn.m3u8", "s1"),
                channel("BBC", "http://a.test/bbc.m3u8", "s1"),
                channel("CNN 2", "http://a.test/cnn.m3u8", "s2"),
            ],
            |c| c.source_url == "s2" || c.name == "BBC",
            DedupPolicy::FirstSeen,
        );

        let names: Vec<_> = outcome.channels.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["CNN 2", "BBC"]);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn latest_wins_on_equal_status() {
        let input = [
            channel("First", "http://a.test/x", "s1"),
            channel("Second", "http://a.test/x", "s2"),
        ];

        let first = merge_channels(input.clone(), |_| true, DedupPolicy::FirstSeen);
        let latest = merge_channels(input, |_| true, DedupPolicy::LatestWins);

        assert_eq!(first.channels[0].name, "First");
        assert_eq!(latest.channels[0].name, "Second");
    }

    #[test]
    fn latest_wins_never_downgrades() {
        let outcome = merge_channels(
            [
                channel("Good", "http://a.test/x", "s1"),
                channel("Bad", "http://a.test/x", "s2"),
            ],
            |c| c.name == "Good",
            DedupPolicy::LatestWins,
        );
        assert_eq!(outcome.channels[0].name, "Good");
    }

    #[test]
    fn failed_channels_are_rejected() {
        let outcome = merge_channels(
            [
                channel("Dead", "http://a.test/dead", "s1"),
                channel("Live", "http://a.test/live", "s1"),
            ],
            |c| c.name == "Live",
            DedupPolicy::FirstSeen,
        );

        assert_eq!(outcome.channels.len(), 1);
        assert_eq!(outcome.rejected[0].name, "Dead");
    }
}
