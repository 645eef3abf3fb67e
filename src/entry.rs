use std::borrow::Cow;
use std::cell::OnceCell;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use html_escape::{encode_double_quoted_attribute, encode_text};
use tracing::debug;
use url::Url;

use crate::config::{FeedConfig, Field};
use crate::content::{normalize, NormalizeOptions};
use crate::document::{CachedDocument, RawEntry, Thumbnail};
use crate::error::ParseError;

const UNTITLED: &str = "Untitled";

/// Thumbnails narrower or shorter than this are icons, not pictures.
const TINY_THUMBNAIL: u32 = 100;

#[derive(Debug)]
pub struct Entry {
    document: Arc<CachedDocument>,
    index: usize,
    config: Arc<FeedConfig>,
    title: String,
    link: String,
    timestamp: Option<DateTime<Utc>>,
    content: OnceCell<String>,
}

impl Entry {
    pub fn new(
        document: Arc<CachedDocument>,
        index: usize,
        config: Arc<FeedConfig>,
    ) -> Result<Self, ParseError> {
        let raw = &document.entries[index];

        let title = raw
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED);
        let title = config.strip.strip(Field::Title, title).trim().to_string();

        let link = raw
            .link
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .ok_or_else(|| ParseError::MissingLink(title.clone()))?;
        let link = resolve_link(link, document.link.as_deref());
        let link = config.strip.strip(Field::Link, &link).into_owned();
        let timestamp = resolve_timestamp(raw, &config);

        Ok(Self {
            document,
            index,
            config,
            title,
            link,
            timestamp,
            content: OnceCell::new(),
        })
    }

    fn raw(&self) -> &RawEntry {
        &self.document.entries[self.index]
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn field(&self, field: Field) -> Cow<'_, str> {
        let raw = self.raw();
        match field {
            Field::Title => Cow::Borrowed(&self.title),
            Field::Link => Cow::Borrowed(&self.link),
            Field::Content => Cow::Borrowed(self.body()),
            Field::Description => Cow::Borrowed(raw.description.as_deref().unwrap_or("")),
            Field::Author => Cow::Borrowed(raw.author.as_deref().unwrap_or("")),
            Field::Tags => Cow::Owned(raw.tags.join(" ")),
            Field::Id => Cow::Borrowed(&raw.id),
        }
    }

    fn body(&self) -> &str {
        let raw = self.raw();
        let (preferred, fallback) = if self.config.full_content {
            (&raw.content, &raw.description)
        } else {
            (&raw.description, &raw.content)
        };
        preferred
            .as_deref()
            .or(fallback.as_deref())
            .unwrap_or("")
    }

    pub fn ignore(&self) -> bool {
        match self.config.ignore.first_match(|field| self.field(field)) {
            Some(field) => {
                debug!("Ignoring {:?}: {} rule matched", self.title, field);
                true
            }
            None => false,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn content(&self) -> &str {
        self.content.get_or_init(|| self.render_content())
    }

    fn render_content(&self) -> String {
        let body = self.config.strip.strip(Field::Content, self.body());

        let html = match self.raw().thumbnail.as_ref().filter(|t| !is_tiny(t)) {
            Some(thumbnail) if !self.config.full_content => {
                format!("{}{}", thumbnail_html(thumbnail), body)
            }
            Some(thumbnail) if !body.contains(&thumbnail.url) => {
                inline_after_first_paragraph(&body, &thumbnail_html(thumbnail))
            }
            _ => body.into_owned(),
        };

        let options = NormalizeOptions {
            max_image_width: self.config.max_image_width,
            base_url: Url::parse(&self.link).ok(),
        };
        let normalized = normalize(&html, &options);

        match self.config.max_content_size {
            Some(limit) if normalized.len() > limit => {
                debug!(
                    "Dropping content of {:?}: {} bytes is over the {} byte limit",
                    self.title,
                    normalized.len(),
                    limit
                );
                String::new()
            }
            _ => normalized,
        }
    }
}

fn resolve_link(link: &str, base: Option<&str>) -> String {
    match base.and_then(|b| Url::parse(b).ok()) {
        Some(base) => base
            .join(link)
            .map(String::from)
            .unwrap_or_else(|_| link.to_string()),
        None => link.to_string(),
    }
}

/// Publish time, then update time, then the raw date text read with the
/// feed's `date_format`.
fn resolve_timestamp(raw: &RawEntry, config: &FeedConfig) -> Option<DateTime<Utc>> {
    raw.published.or(raw.updated).or_else(|| {
        let format = config.date_format.as_deref()?;
        let text = raw.date_raw.as_deref()?;
        parse_custom_date(text.trim(), format, config.timezone)
    })
}

/// Read `text` with a strftime-style `format`. Formats without an offset
/// are taken as local time in `tz`; formats without a time as midnight.
pub fn parse_custom_date(text: &str, format: &str, tz: Tz) -> Option<DateTime<Utc>> {
    if let Ok(date) = DateTime::parse_from_str(text, format) {
        return Some(date.with_timezone(&Utc));
    }
    let local = match NaiveDateTime::parse_from_str(text, format) {
        Ok(local) => local,
        Err(_) => NaiveDate::parse_from_str(text, format)
            .ok()?
            .and_hms_opt(0, 0, 0)?,
    };
    tz.from_local_datetime(&local)
        .earliest()
        .map(|date| date.with_timezone(&Utc))
}

fn is_tiny(thumbnail: &Thumbnail) -> bool {
    thumbnail.width.is_some_and(|w| w < TINY_THUMBNAIL)
        || thumbnail.height.is_some_and(|h| h < TINY_THUMBNAIL)
}

fn thumbnail_html(thumbnail: &Thumbnail) -> String {
    let mut html = format!(
        "<img class=\"thumbnail\" src=\"{}\" alt=\"\"",
        encode_double_quoted_attribute(&thumbnail.url)
    );
    if let Some(width) = thumbnail.width {
        html.push_str(&format!(" width=\"{}\"", width));
    }
    if let Some(height) = thumbnail.height {
        html.push_str(&format!(" height=\"{}\"", height));
    }
    html.push('>');
    html
}

fn inline_after_first_paragraph(body: &str, thumbnail: &str) -> String {
    match body.find("</p>") {
        Some(position) => {
            let (head, tail) = body.split_at(position + "</p>".len());
            format!("{}{}{}", head, thumbnail, tail)
        }
        None => format!("{}{}", thumbnail, body),
    }
}

#[derive(Debug)]
pub struct DigestEntry {
    timestamp: DateTime<Utc>,
    link: String,
    title: String,
    // oldest first
    constituents: Vec<Item>,
    content: OnceCell<String>,
}

impl DigestEntry {
    pub fn new(timestamp: DateTime<Utc>, link: String, title: String, constituents: Vec<Item>) -> Self {
        Self {
            timestamp,
            link,
            title,
            constituents,
            content: OnceCell::new(),
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn link(&self) -> &str {
        &self.link
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn constituents(&self) -> &[Item] {
        &self.constituents
    }

    pub fn content(&self) -> &str {
        self.content.get_or_init(|| {
            self.constituents
                .iter()
                .map(|item| {
                    format!(
                        "<h1><a href=\"{}\">{}</a></h1>\n{}\n",
                        encode_double_quoted_attribute(item.link()),
                        encode_text(item.title()),
                        item.content()
                    )
                })
                .collect()
        })
    }
}

#[derive(Debug)]
pub enum Item {
    Entry(Entry),
    Digest(DigestEntry),
}

impl Item {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Item::Entry(entry) => entry.timestamp(),
            Item::Digest(digest) => Some(digest.timestamp()),
        }
    }

    pub fn timestamp_or(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp().unwrap_or(now)
    }

    pub fn link(&self) -> &str {
        match self {
            Item::Entry(entry) => entry.link(),
            Item::Digest(digest) => digest.link(),
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Item::Entry(entry) => entry.title(),
            Item::Digest(digest) => digest.title(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Item::Entry(entry) => entry.content(),
            Item::Digest(digest) => digest.content(),
        }
    }

    pub fn field(&self, field: Field) -> Cow<'_, str> {
        match self {
            Item::Entry(entry) => entry.field(field),
            Item::Digest(digest) => match field {
                Field::Title => Cow::Borrowed(digest.title()),
                Field::Link => Cow::Borrowed(digest.link()),
                Field::Content => Cow::Borrowed(digest.content()),
                _ => Cow::Borrowed(""),
            },
        }
    }
}
