use std::collections::BTreeMap;

use crate::channel::ChannelEntry;

/// Channels grouped by category. Categories iterate sorted by name,
/// channels keep their merge order.
#[derive(Debug, Default)]
pub struct Categories<'a> {
    groups: BTreeMap<&'a str, Vec<&'a ChannelEntry>>,
}

impl<'a> Categories<'a> {
    pub fn iter(&self) -> impl Iterator<Item = (&'a str, &[&'a ChannelEntry])> {
        self.groups.iter().map(|(name, channels)| (*name, channels.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Places every channel in exactly one category, blank categories go to `default_category`
pub fn categorize<'a>(channels: &'a [ChannelEntry], default_category: &'a str) -> Categories<'a> {
    let mut groups: BTreeMap<&str, Vec<&ChannelEntry>> = BTreeMap::new();
    for channel in channels {
        let category = match channel.category.trim() {
            "" => default_category,
            category => category,
        };
        groups.entry(category).or_default().push(channel);
    }
    Categories { groups }
}

/// Turns a category name into a file name that stays inside the categories directory
pub fn category_file_stem(category: &str) -> String {
    let stem: String = category
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let stem = stem.trim().trim_matches('.');

    if stem.is_empty() {
        "_".to_string()
    } else {
        stem.to_string()
    }
}
