use chrono::{DateTime, Utc};
use feed_rs::model::{Entry as FeedEntry, Link};
use feed_rs::parser::{self, ParseFeedError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationTag {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl ValidationTag {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thumbnail {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEntry {
    pub id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    // as it appeared in the XML, for a custom `date_format`
    pub date_raw: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub tags: Vec<String>,
    pub thumbnail: Option<Thumbnail>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedDocument {
    pub url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub validation: ValidationTag,
    pub status: u16,
    /// The body did not parse cleanly; `bozo_message` says why.
    pub bozo: bool,
    pub bozo_message: Option<String>,
    pub entries: Vec<RawEntry>,
}

#[derive(Debug, Default)]
pub struct ParsedBody {
    pub title: Option<String>,
    pub link: Option<String>,
    pub entries: Vec<RawEntry>,
    pub error: Option<ParseFeedError>,
}

pub fn parse_body(bytes: &[u8]) -> ParsedBody {
    let feed = match parser::parse(bytes) {
        Ok(feed) => feed,
        Err(error) => {
            return ParsedBody {
                error: Some(error),
                ..Default::default()
            }
        }
    };

    // feed-rs drops dates it cannot parse, keep the raw text around for
    // feeds that configure their own format
    let mut dates = extract_dates_from_xml(bytes);
    if dates.len() != feed.entries.len() {
        dates.clear();
    }
    dates.resize(feed.entries.len(), None);

    ParsedBody {
        title: feed.title.map(|t| t.content.trim().to_string()),
        link: preferred_link(&feed.links),
        entries: feed
            .entries
            .into_iter()
            .zip(dates)
            .map(|(entry, date_raw)| raw_entry(entry, date_raw))
            .collect(),
        error: None,
    }
}

fn preferred_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |rel| rel == "alternate"))
        .or_else(|| links.first())
        .map(|l| l.href.clone())
}

fn raw_entry(entry: FeedEntry, date_raw: Option<String>) -> RawEntry {
    let thumbnail = entry
        .media
        .iter()
        .flat_map(|m| m.thumbnails.iter())
        .map(|t| Thumbnail {
            url: t.image.uri.clone(),
            width: t.image.width,
            height: t.image.height,
        })
        .next()
        .or_else(|| {
            entry
                .media
                .iter()
                .flat_map(|m| m.content.iter())
                .find(|c| {
                    c.content_type
                        .as_ref()
                        .is_some_and(|t| t.to_string().starts_with("image/"))
                })
                .and_then(|c| {
                    Some(Thumbnail {
                        url: c.url.as_ref()?.to_string(),
                        width: c.width,
                        height: c.height,
                    })
                })
        });

    let author = Some(
        entry
            .authors
            .iter()
            .map(|person| person.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
    )
    .filter(|a| !a.is_empty());

    RawEntry {
        link: preferred_link(&entry.links),
        title: entry.title.map(|t| t.content),
        published: entry.published,
        updated: entry.updated,
        date_raw,
        description: entry.summary.map(|s| s.content),
        content: entry.content.and_then(|c| c.body),
        author,
        tags: entry.categories.into_iter().map(|c| c.term).collect(),
        thumbnail,
        id: entry.id,
    }
}

pub fn extract_dates_from_xml(xml_bytes: &[u8]) -> Vec<Option<String>> {
    let xml = match std::str::from_utf8(xml_bytes) {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    let mut blocks = element_blocks(xml, "item");
    if blocks.is_empty() {
        blocks = element_blocks(xml, "entry");
    }

    blocks
        .into_iter()
        .map(|block| {
            ["pubDate", "published", "dc:date", "updated"]
                .iter()
                .find_map(|tag| extract_xml_element(block, tag))
                .map(|date| strip_cdata(&date).to_string())
                .filter(|date| !date.is_empty())
        })
        .collect()
}

fn element_blocks<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);

    let mut blocks = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        if !after.starts_with(|c: char| c == '>' || c.is_whitespace()) {
            rest = after;
            continue;
        }
        let end = after.find(&close).unwrap_or(after.len());
        blocks.push(&after[..end]);
        rest = &after[end..];
    }
    blocks
}

pub fn extract_xml_element(xml: &str, tag: &str) -> Option<String> {
    let start_tag = format!("<{}>", tag);
    let end_tag = format!("</{}>", tag);

    let start = xml.find(&start_tag)? + start_tag.len();
    let end = xml[start..].find(&end_tag)? + start;

    Some(xml[start..end].trim().to_string())
}

fn strip_cdata(text: &str) -> &str {
    text.strip_prefix("<![CDATA[")
        .and_then(|t| t.strip_suffix("]]>"))
        .unwrap_or(text)
        .trim()
}
