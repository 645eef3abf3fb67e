use std::cmp::Reverse;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::config::{normalize_id, Config, FeedConfig};
use crate::digest::Digest;
use crate::document::CachedDocument;
use crate::entry::{Entry, Item};
use crate::error::{ConfigError, RetrievalError};
use crate::group::Group;
use crate::retrieval::{fetch_or_refresh, FetchContext};

#[derive(Debug)]
pub enum Node {
    Feed(Feed),
    Group(Group),
    Digest(Digest),
}

impl Node {
    pub fn with_digest(node: Node) -> Node {
        match node.config().digest.clone() {
            Some(settings) => Node::Digest(Digest::new(settings, node)),
            None => node,
        }
    }

    pub fn fetch<'a>(&'a mut self, ctx: &'a FetchContext<'_>) -> BoxFuture<'a, Result<(), RetrievalError>> {
        match self {
            Node::Feed(feed) => feed.fetch(ctx).boxed(),
            Node::Group(group) => group.fetch(ctx).boxed(),
            Node::Digest(digest) => digest.inner_mut().fetch(ctx),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        match self {
            Node::Feed(feed) => feed.config(),
            Node::Group(group) => group.config(),
            Node::Digest(digest) => digest.inner().config(),
        }
    }

    pub fn title(&self) -> String {
        match self {
            Node::Feed(feed) => feed.title(),
            Node::Group(group) => group.title(),
            Node::Digest(digest) => digest.inner().title(),
        }
    }

    pub fn classes(&self) -> BTreeSet<String> {
        match self {
            Node::Feed(feed) => feed.classes(),
            Node::Group(group) => group.classes(),
            Node::Digest(digest) => {
                let mut classes = digest.inner().classes();
                classes.insert("digest".to_string());
                classes
            }
        }
    }

    /// The url, or the title for nodes without one.
    pub fn identity(&self) -> String {
        let config = self.config();
        config
            .url
            .clone()
            .or_else(|| config.url_disabled.clone())
            .unwrap_or_else(|| self.title())
    }

    pub fn entries(&self, now: DateTime<Utc>) -> Vec<Item> {
        match self {
            Node::Feed(feed) => feed.entries(now),
            Node::Group(group) => group.entries(now),
            Node::Digest(digest) => digest.entries(now),
        }
    }

    pub fn update_url(&mut self, config: &Mutex<Config>, url: &str) -> Result<(), ConfigError> {
        match self {
            Node::Feed(feed) => feed.update_url(config, url),
            Node::Group(group) => Err(ConfigError::NoUrl(group.title())),
            Node::Digest(digest) => digest.inner_mut().update_url(config, url),
        }
    }

    pub fn disable_url(&mut self, config: &Mutex<Config>) -> Result<(), ConfigError> {
        match self {
            Node::Feed(feed) => feed.disable_url(config),
            Node::Group(group) => Err(ConfigError::NoUrl(group.title())),
            Node::Digest(digest) => digest.inner_mut().disable_url(config),
        }
    }
}

pub(crate) fn base_classes(role: &str, config: &FeedConfig) -> BTreeSet<String> {
    let mut classes = BTreeSet::from([role.to_string()]);
    let category = normalize_id(&config.category);
    if !category.is_empty() {
        classes.insert(category);
    }
    classes
}

#[derive(Debug)]
pub struct Feed {
    config: Arc<FeedConfig>,
    document: Option<Arc<CachedDocument>>,
}

impl Feed {
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config: Arc::new(config),
            document: None,
        }
    }

    pub fn with_document(config: FeedConfig, document: CachedDocument) -> Self {
        Self {
            config: Arc::new(config),
            document: Some(Arc::new(document)),
        }
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    pub fn url(&self) -> Option<&str> {
        self.config.url.as_deref()
    }

    pub async fn fetch(&mut self, ctx: &FetchContext<'_>) -> Result<(), RetrievalError> {
        let document = fetch_or_refresh(self, ctx).await?;
        info!(
            "Fetched '{}' ({} entries)",
            self.config.label(),
            document.entries.len()
        );
        self.document = Some(document);
        Ok(())
    }

    pub fn title(&self) -> String {
        self.config
            .title
            .clone()
            .or_else(|| {
                self.document
                    .as_ref()
                    .and_then(|d| d.title.clone())
                    .filter(|t| !t.trim().is_empty())
            })
            .unwrap_or_else(|| self.config.label().to_string())
    }

    pub fn classes(&self) -> BTreeSet<String> {
        base_classes("feed", &self.config)
    }

    /// Entries that survive the ignore rules, newest first when `sort` is set.
    pub fn entries(&self, now: DateTime<Utc>) -> Vec<Item> {
        let Some(document) = &self.document else {
            return Vec::new();
        };

        let mut items: Vec<Item> = (0..document.entries.len())
            .filter_map(|index| {
                match Entry::new(Arc::clone(document), index, Arc::clone(&self.config)) {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Skipping entry in '{}': {}", self.config.label(), e);
                        None
                    }
                }
            })
            .filter(|entry| !entry.ignore())
            .inspect(|entry| {
                if entry.timestamp().is_none() {
                    warn!("{:?} has no usable date, using the current time", entry.title());
                }
            })
            .map(Item::Entry)
            .collect();

        if self.config.sort {
            items.sort_by_cached_key(|item| Reverse(item.timestamp_or(now)));
        }
        items
    }

    pub fn update_url(&mut self, config: &Mutex<Config>, url: &str) -> Result<(), ConfigError> {
        let index = self
            .config
            .index
            .ok_or_else(|| ConfigError::NoUrl(self.config.label().to_string()))?;
        let comment = format!(
            "moved permanently from {} on {}",
            self.url().unwrap_or("(none)"),
            Utc::now().format("%Y-%m-%d")
        );

        config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_feed_url(index, url, &comment)?;

        Arc::make_mut(&mut self.config).url = Some(url.to_string());
        Ok(())
    }

    pub fn disable_url(&mut self, config: &Mutex<Config>) -> Result<(), ConfigError> {
        let index = self
            .config
            .index
            .ok_or_else(|| ConfigError::NoUrl(self.config.label().to_string()))?;
        let comment = format!("gone (HTTP 410) as of {}", Utc::now().format("%Y-%m-%d"));

        config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disable_feed_url(index, &comment)?;

        let settings = Arc::make_mut(&mut self.config);
        settings.url_disabled = settings.url.take();
        Ok(())
    }
}

/// Builds the page's nodes in configuration order.
pub fn build_nodes(config: &Config) -> Result<Vec<Node>, ConfigError> {
    enum Slot {
        Node(Node),
        Group(String),
    }

    let mut slots = Vec::new();
    let mut groups: HashMap<String, Group> = HashMap::new();

    for (index, table) in config.feeds() {
        let settings = FeedConfig::for_feed(config, index, table)?;
        if settings.url.is_none() {
            debug!("Skipping '{}': no url", settings.label());
            continue;
        }

        let group_id = settings.group.clone();
        let node = Node::with_digest(Node::Feed(Feed::new(settings)));

        match group_id {
            None => slots.push(Slot::Node(node)),
            Some(id) => match groups.entry(normalize_id(&id)) {
                MapEntry::Occupied(group) => group.into_mut().push(node),
                MapEntry::Vacant(slot) => {
                    let group_settings = FeedConfig::for_group(config, &id)?;
                    slots.push(Slot::Group(slot.key().clone()));
                    slot.insert(Group::new(id, group_settings)).push(node);
                }
            },
        }
    }

    Ok(slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Node(node) => Some(node),
            Slot::Group(key) => groups
                .remove(&key)
                .map(|group| Node::with_digest(Node::Group(group))),
        })
        .collect())
}
