use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;
use url::Url;

use crate::error::ParseError;

static MEDIA_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<(img|video)(\s(?:[^>"']|"[^"]*"|'[^']*')*)?>"#).expect("valid tag regex")
});

static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("valid attribute regex")
});

static BLOGGER_SIZE_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[swh]\d+(?:-[a-z0-9-]*)?$").expect("valid blogger regex"));

static BLOGGER_SIZE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"=[swh]\d+(?:-[a-z0-9-]*)?$").expect("valid blogger regex"));

/// Hosts that resize on a `w` query parameter.
const WIDTH_QUERY_HOSTS: &[&str] = &[
    "wp.com",
    "files.wordpress.com",
    "imgix.net",
    "images.unsplash.com",
];

const BLOGGER_HOSTS: &[&str] = &["blogger.googleusercontent.com", "bp.blogspot.com"];

/// Query keys dropped before a width is set, since they would fight it.
const SIZE_QUERY_KEYS: &[&str] = &["w", "h", "width", "height", "resize", "fit"];

const WORDPRESS_UPLOADS: &str = "/wp-content/uploads/";
const WORDPRESS_PROXY: &str = "https://i0.wp.com";

#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    pub max_image_width: Option<u32>,
    pub base_url: Option<Url>,
}

/// Rewrite every media tag in `html`. A tag that cannot be rewritten is left as it was.
pub fn normalize(html: &str, options: &NormalizeOptions) -> String {
    MEDIA_TAG
        .replace_all(html, |caps: &Captures| {
            let name = caps[1].to_ascii_lowercase();
            let attributes = caps.get(2).map_or("", |m| m.as_str());
            match rewrite_tag(&name, attributes, options) {
                Ok(tag) => tag,
                Err(e) => {
                    debug!("Leaving tag unchanged: {}", e);
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn rewrite_tag(name: &str, attributes: &str, options: &NormalizeOptions) -> Result<String, ParseError> {
    let mut tag = Tag::parse(name, attributes)?;
    if name == "img" {
        rewrite_image(&mut tag, options)?;
    } else {
        rewrite_video(&mut tag);
    }
    Ok(tag.to_html())
}

fn rewrite_video(tag: &mut Tag) {
    tag.set("preload", "none");
    tag.remove("autoplay");
}

fn rewrite_image(tag: &mut Tag, options: &NormalizeOptions) -> Result<(), ParseError> {
    if !tag.has("loading") {
        tag.set("loading", "lazy");
    }

    let src = tag.get("src").filter(|s| !s.trim().is_empty()).map(str::to_owned);
    if let Some(src) = src {
        let url = resolve(&src, options.base_url.as_ref())?;
        let resized = options
            .max_image_width
            .and_then(|width| resized_image_url(&url, width));
        match resized {
            Some(resized) if resized.as_str() != src => {
                tag.set("src", resized.as_str());
                tag.remove("srcset");
                tag.remove("sizes");
            }
            Some(_) => {}
            None if url.as_str() != src => tag.set("src", url.as_str()),
            None => {}
        }
    }

    if let Some(max_width) = options.max_image_width {
        if let Some(width) = dimension(tag.get("width")).filter(|w| *w > max_width) {
            if let Some(height) = dimension(tag.get("height")) {
                tag.set("height", scale(height, max_width, width).to_string());
            }
            tag.set("width", max_width.to_string());
        }
    }

    let width = dimension(tag.get("width"));
    let height = dimension(tag.get("height"));
    if let (Some(width), Some(height)) = (width, height) {
        let style = tag.get("style").unwrap_or("").trim();
        if width > 0 && height > 0 && !style.contains("aspect-ratio") {
            let ratio = format!("aspect-ratio: {} / {};", width, height);
            let style = match style.trim_end_matches(';') {
                "" => ratio,
                rest => format!("{}; {}", rest, ratio),
            };
            tag.set("style", style);
        }
    }

    Ok(())
}

fn resolve(src: &str, base: Option<&Url>) -> Result<Url, ParseError> {
    let parsed = match base {
        Some(base) => base.join(src.trim()),
        None => Url::parse(src.trim()),
    };
    parsed.map_err(|source| ParseError::Url {
        url: src.to_string(),
        source,
    })
}

fn dimension(value: Option<&str>) -> Option<u32> {
    value?.trim().trim_end_matches("px").trim().parse().ok()
}

fn scale(value: u32, numerator: u32, denominator: u32) -> u32 {
    let denominator = u64::from(denominator.max(1));
    ((u64::from(value) * u64::from(numerator) + denominator / 2) / denominator) as u32
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// The same image from its CDN at no more than `max_width` pixels wide.
pub fn resized_image_url(url: &Url, max_width: u32) -> Option<Url> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();

    if WIDTH_QUERY_HOSTS.iter().any(|domain| host_matches(&host, domain)) {
        return Some(with_width(url, max_width));
    }
    if BLOGGER_HOSTS.iter().any(|domain| host_matches(&host, domain)) {
        return blogger_resized(url, max_width);
    }
    if url.path().contains(WORDPRESS_UPLOADS) && url.port().is_none() {
        let proxied = Url::parse(&format!("{}/{}{}", WORDPRESS_PROXY, host, url.path())).ok()?;
        return Some(with_width(&proxied, max_width));
    }
    None
}

fn with_width(url: &Url, width: u32) -> Url {
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !SIZE_QUERY_KEYS.contains(&key.as_ref()))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    let mut resized = url.clone();
    resized
        .query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("w", &width.to_string());
    resized
}

fn blogger_resized(url: &Url, max_width: u32) -> Option<Url> {
    let size = format!("w{}", max_width);
    let mut segments: Vec<String> = url.path_segments()?.map(str::to_owned).collect();

    // /s1600/photo.jpg style: the size is its own path segment
    if let Some(position) = segments.iter().rposition(|s| BLOGGER_SIZE_SEGMENT.is_match(s)) {
        segments[position] = size;
    } else {
        // /AVvXsE...=s1600 style: the size trails the last segment
        let last = segments.last_mut()?;
        if !BLOGGER_SIZE_SUFFIX.is_match(last) {
            return None;
        }
        let replaced = BLOGGER_SIZE_SUFFIX
            .replace(last.as_str(), format!("={}", size).as_str())
            .into_owned();
        *last = replaced;
    }

    let mut resized = url.clone();
    resized.set_path(&format!("/{}", segments.join("/")));
    Some(resized)
}

#[derive(Debug)]
struct Tag {
    name: String,
    attributes: Vec<(String, Option<String>)>,
    self_closing: bool,
}

impl Tag {
    fn parse(name: &str, source: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedTag(name.to_string());
        let stray = |text: &str| !text.chars().all(|c| c.is_whitespace() || c == '/');

        let mut attributes: Vec<(String, Option<String>)> = Vec::new();
        let mut last = 0;
        for caps in ATTRIBUTE.captures_iter(source) {
            let whole = caps.get(0).ok_or_else(malformed)?;
            if stray(&source[last..whole.start()]) {
                return Err(malformed());
            }
            last = whole.end();

            let key = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| html_escape::decode_html_entities(m.as_str()).into_owned());
            // the first occurrence wins, as in browsers
            if !attributes.iter().any(|(k, _)| *k == key) {
                attributes.push((key, value));
            }
        }
        if stray(&source[last..]) {
            return Err(malformed());
        }

        Ok(Self {
            name: name.to_string(),
            attributes,
            self_closing: source.trim_end().ends_with('/'),
        })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_deref())
    }

    fn has(&self, key: &str) -> bool {
        self.attributes.iter().any(|(k, _)| k == key)
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = Some(value.into());
        match self.attributes.iter_mut().find(|(k, _)| k == key) {
            Some(attribute) => attribute.1 = value,
            None => self.attributes.push((key.to_string(), value)),
        }
    }

    fn remove(&mut self, key: &str) {
        self.attributes.retain(|(k, _)| k != key);
    }

    fn to_html(&self) -> String {
        let mut html = format!("<{}", self.name);
        for (key, value) in &self.attributes {
            match value {
                Some(value) => {
                    let _ = write!(
                        html,
                        " {}=\"{}\"",
                        key,
                        html_escape::encode_double_quoted_attribute(value)
                    );
                }
                None => {
                    let _ = write!(html, " {}", key);
                }
            }
        }
        if self.self_closing {
            html.push_str(" /");
        }
        html.push('>');
        html
    }
}
