use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use tracing::{debug, error, warn};

use crate::config::{DigestConfig, IdRule, Interval};
use crate::entry::{DigestEntry, Item};
use crate::feed::Node;

/// Fallback digest titles are cut to this many characters.
const FALLBACK_TITLE_CHARS: usize = 50;

type BucketKey = (i32, i64, u32);

#[derive(Debug)]
pub struct Digest {
    settings: DigestConfig,
    inner: Box<Node>,
}

impl Digest {
    pub fn new(settings: DigestConfig, inner: Node) -> Self {
        Self {
            settings,
            inner: Box::new(inner),
        }
    }

    pub fn inner(&self) -> &Node {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Node {
        &mut self.inner
    }

    /// One entry per bucket, most recent bucket first.
    pub fn entries(&self, now: DateTime<Utc>) -> Vec<Item> {
        let tz = self.inner.config().timezone;
        let title = self.inner.title();

        let mut buckets: BTreeMap<BucketKey, Vec<Item>> = BTreeMap::new();
        for item in self.inner.entries(now) {
            match item.timestamp() {
                Some(timestamp) => buckets
                    .entry(bucket_key(self.settings.interval, timestamp, tz))
                    .or_default()
                    .push(item),
                None => warn!("'{}': leaving undated {:?} out of the digest", title, item.title()),
            }
        }

        let digests: Vec<Item> = buckets
            .into_iter()
            .rev()
            .filter_map(|(key, constituents)| {
                let digest = self.digest_bucket(constituents);
                if digest.is_none() {
                    debug!("'{}': no id found for bucket {:?}, dropping it", title, key);
                }
                digest.map(Item::Digest)
            })
            .collect();

        if digests.is_empty() {
            error!("'{}': no digest entries could be formed, listing entries individually", title);
            return self.inner.entries(now);
        }
        digests
    }

    fn digest_bucket(&self, mut constituents: Vec<Item>) -> Option<DigestEntry> {
        let (link, title) = match &self.settings.id {
            Some(rule) => match extract_id(rule, &constituents) {
                Some(found) => found,
                None if self.settings.partial => fallback(&constituents)?,
                None => return None,
            },
            None => fallback(&constituents)?,
        };

        let timestamp = constituents.iter().filter_map(Item::timestamp).max()?;
        constituents.sort_by_key(Item::timestamp);

        Some(DigestEntry::new(timestamp, link, title, constituents))
    }
}

pub fn bucket_key(interval: Interval, timestamp: DateTime<Utc>, tz: Tz) -> BucketKey {
    let local = timestamp.with_timezone(&tz);
    let year = local.year();
    let ordinal = i64::from(local.ordinal());
    match interval {
        Interval::Hour => (year, ordinal, local.hour()),
        Interval::Day => (year, ordinal, 0),
        Interval::Week => (
            year,
            ordinal - i64::from(local.weekday().num_days_from_monday()),
            0,
        ),
        Interval::Month => (year, i64::from(local.month()), 0),
    }
}

fn extract_id(rule: &IdRule, constituents: &[Item]) -> Option<(String, String)> {
    constituents.iter().find_map(|item| {
        let text = item.field(rule.source);
        let captures = rule.find.captures(&text)?;

        let mut link = String::new();
        captures.expand(&rule.link, &mut link);
        let mut title = String::new();
        captures.expand(&rule.title, &mut title);
        Some((link, title))
    })
}

fn fallback(constituents: &[Item]) -> Option<(String, String)> {
    let first = constituents.first()?;
    Some((first.link().to_string(), truncate(first.title(), FALLBACK_TITLE_CHARS)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}…", text[..end].trim_end()),
        None => text.to_string(),
    }
}
