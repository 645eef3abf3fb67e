use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono_tz::Tz;
use regex::Regex;
use sha2::{Digest, Sha256};
use toml_edit::{DocumentMut, Item, Table, TableLike, Value};
use tracing::{debug, info};

use crate::cache::write_atomically;
use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "feeds.toml";

const DEFAULT_CATEGORY: &str = "uncategorized";
const DEFAULT_MAX_ENTRY_NUM: usize = 10;
const DEFAULT_MAX_ENTRY_AGE: i64 = 30;

pub struct Config {
    path: Option<PathBuf>,
    doc: DocumentMut,
    checksum: String,
    dirty: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_str(&content)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let doc = content.parse::<DocumentMut>()?;

        if let Some(feeds) = doc.get("feeds") {
            if !feeds.is_array_of_tables() {
                return Err(invalid("configuration", "feeds", "expected [[feeds]] tables"));
            }
        }
        for section in ["categories", "groups"] {
            if let Some(item) = doc.get(section) {
                if item.as_table_like().is_none() {
                    return Err(invalid("configuration", section, "expected a table"));
                }
            }
        }

        Ok(Self {
            path: None,
            doc,
            checksum: checksum(content),
            dirty: false,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn root(&self) -> &Table {
        self.doc.as_table()
    }

    pub fn feeds(&self) -> impl Iterator<Item = (usize, &Table)> {
        self.doc
            .get("feeds")
            .and_then(Item::as_array_of_tables)
            .into_iter()
            .flat_map(|feeds| feeds.iter())
            .enumerate()
    }

    pub fn category(&self, name: &str) -> Option<&dyn TableLike> {
        self.section_table("categories", name)
    }

    pub fn group(&self, id: &str) -> Option<&dyn TableLike> {
        self.section_table("groups", id)
    }

    fn section_table(&self, section: &str, name: &str) -> Option<&dyn TableLike> {
        let wanted = normalize_id(name);
        self.doc
            .get(section)?
            .as_table_like()?
            .iter()
            .find(|(key, _)| normalize_id(key) == wanted)
            .and_then(|(_, item)| item.as_table_like())
    }

    #[cfg(test)]
    pub(crate) fn timezone(&self) -> Result<Tz, ConfigError> {
        match self.root().get("timezone") {
            None => Ok(Tz::UTC),
            Some(item) => parse_timezone("configuration", item),
        }
    }

    pub fn set_feed_url(&mut self, index: usize, url: &str, comment: &str) -> Result<(), ConfigError> {
        let table = self.feed_table_mut(index)?;
        table.insert("url", commented(url, comment));
        self.dirty = true;
        debug!("feeds[{}].url = {} ({})", index, url, comment);
        Ok(())
    }

    pub fn disable_feed_url(&mut self, index: usize, comment: &str) -> Result<(), ConfigError> {
        let table = self.feed_table_mut(index)?;
        let url = table
            .remove("url")
            .and_then(|item| item.as_str().map(str::to_owned))
            .ok_or_else(|| ConfigError::NoUrl(format!("feeds[{}]", index)))?;
        table.insert("url_disabled", commented(&url, comment));
        self.dirty = true;
        debug!("feeds[{}].url_disabled = {} ({})", index, url, comment);
        Ok(())
    }

    fn feed_table_mut(&mut self, index: usize) -> Result<&mut Table, ConfigError> {
        self.doc
            .get_mut("feeds")
            .and_then(Item::as_array_of_tables_mut)
            .and_then(|feeds| feeds.get_mut(index))
            .ok_or(ConfigError::MissingFeed(index))
    }

    /// Write the document back if it was modified. Returns whether the file was written.
    pub fn save(&mut self) -> Result<bool, ConfigError> {
        if !self.dirty {
            return Ok(false);
        }

        let text = self.doc.to_string();
        let new_checksum = checksum(&text);
        if new_checksum == self.checksum {
            debug!("Configuration marked modified but unchanged, not saving");
            self.dirty = false;
            return Ok(false);
        }

        let path = self.path.clone().ok_or(ConfigError::NoPath)?;
        write_atomically(&path, text.as_bytes())
            .map_err(|source| ConfigError::Write { path: path.clone(), source })?;

        self.checksum = new_checksum;
        self.dirty = false;
        info!("Saved configuration changes to {}", path.display());
        Ok(true)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.doc)
    }
}

fn checksum(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

fn commented(value: &str, comment: &str) -> Item {
    let mut value = Value::from(value);
    value.decor_mut().set_suffix(format!(" # {}", comment));
    Item::Value(value)
}

fn invalid(context: &str, key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        context: context.to_string(),
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_timezone(context: &str, item: &Item) -> Result<Tz, ConfigError> {
    let name = item
        .as_str()
        .ok_or_else(|| invalid(context, "timezone", "expected a string"))?;
    name.parse::<Tz>()
        .map_err(|e| invalid(context, "timezone", e.to_string()))
}

/// Turn a category or group name into an identifier usable as a display class.
pub fn normalize_id(name: &str) -> String {
    let name = name.replace(' ', "_");
    let start = name
        .find(|c: char| c.is_alphabetic() || c == '_')
        .unwrap_or(name.len());
    name[start..]
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

struct Layers<'a> {
    context: String,
    tables: Vec<&'a dyn TableLike>,
    own: Option<&'a dyn TableLike>,
}

impl<'a> Layers<'a> {
    fn get(&self, key: &str) -> Option<&'a Item> {
        self.tables.iter().rev().copied().find_map(|table| table.get(key))
    }

    fn own(&self, key: &str) -> Option<&'a Item> {
        self.own.and_then(|table| table.get(key))
    }

    fn invalid(&self, key: &str, message: impl Into<String>) -> ConfigError {
        invalid(&self.context, key, message)
    }

    fn string(&self, key: &str, item: Option<&'a Item>) -> Result<Option<String>, ConfigError> {
        item.map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| self.invalid(key, "expected a string"))
        })
        .transpose()
    }

    fn boolean(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.get(key)
            .map(|item| item.as_bool().ok_or_else(|| self.invalid(key, "expected true or false")))
            .transpose()
    }

    fn count(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get(key)
            .map(|item| {
                item.as_integer()
                    .and_then(|n| u64::try_from(n).ok())
                    .ok_or_else(|| self.invalid(key, "expected a non-negative integer"))
            })
            .transpose()
    }
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub index: Option<usize>,
    pub url: Option<String>,
    pub url_disabled: Option<String>,
    pub title: Option<String>,
    pub category: String,
    pub group: Option<String>,
    pub timezone: Tz,
    pub max_entry_num: usize,
    // days
    pub max_entry_age: i64,
    pub max_content_size: Option<usize>,
    pub max_image_width: Option<u32>,
    pub full_content: bool,
    pub sort: bool,
    pub hide: bool,
    pub date_format: Option<String>,
    pub ignore: RuleSet,
    pub strip: RuleSet,
    pub digest: Option<DigestConfig>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            index: None,
            url: None,
            url_disabled: None,
            title: None,
            category: DEFAULT_CATEGORY.to_string(),
            group: None,
            timezone: Tz::UTC,
            max_entry_num: DEFAULT_MAX_ENTRY_NUM,
            max_entry_age: DEFAULT_MAX_ENTRY_AGE,
            max_content_size: None,
            max_image_width: None,
            full_content: false,
            sort: false,
            hide: false,
            date_format: None,
            ignore: RuleSet::default(),
            strip: RuleSet::default(),
            digest: None,
        }
    }
}

impl FeedConfig {
    pub fn for_feed(config: &Config, index: usize, table: &Table) -> Result<Self, ConfigError> {
        let mut context = format!("feeds[{}]", index);
        if let Some(url) = table.get("url").and_then(Item::as_str) {
            context = format!("{} ({})", context, url);
        }

        let group_id = match table.get("group") {
            None => None,
            Some(item) => Some(
                item.as_str()
                    .map(normalize_id)
                    .ok_or_else(|| invalid(&context, "group", "expected a string"))?,
            ),
        };
        let group = group_id.as_deref().and_then(|id| config.group(id));

        let mut upper: Vec<&dyn TableLike> = vec![config.root()];
        upper.extend(group);
        upper.push(table);

        let layers = Self::layers(config, context, upper, Some(table as &dyn TableLike))?;
        let mut resolved = Self::resolve(&layers)?;
        resolved.index = Some(index);
        resolved.url = layers.string("url", layers.own("url"))?;
        resolved.url_disabled = layers.string("url_disabled", layers.own("url_disabled"))?;
        resolved.group = group_id;
        Ok(resolved)
    }

    pub fn for_group(config: &Config, id: &str) -> Result<Self, ConfigError> {
        let group = config.group(id);

        let mut upper: Vec<&dyn TableLike> = vec![config.root()];
        upper.extend(group);

        let layers = Self::layers(config, format!("groups.{}", id), upper, group)?;
        let mut resolved = Self::resolve(&layers)?;
        resolved.group = Some(normalize_id(id));
        Ok(resolved)
    }

    fn layers<'a>(
        config: &'a Config,
        context: String,
        upper: Vec<&'a dyn TableLike>,
        own: Option<&'a dyn TableLike>,
    ) -> Result<Layers<'a>, ConfigError> {
        let mut layers = Layers {
            context,
            tables: upper,
            own,
        };
        if let Some(name) = layers.string("category", layers.get("category"))? {
            if let Some(category) = config.category(&name) {
                layers.tables.insert(1, category);
            }
        }
        Ok(layers)
    }

    fn resolve(layers: &Layers<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timezone = match layers.get("timezone") {
            Some(item) => parse_timezone(&layers.context, item)?,
            None => defaults.timezone,
        };

        let max_image_width = layers
            .count("max_image_width")?
            .map(|width| u32::try_from(width).map_err(|_| layers.invalid("max_image_width", "too large")))
            .transpose()?;

        let max_entry_age = layers
            .count("max_entry_age")?
            .map(|age| {
                i64::try_from(age)
                    .ok()
                    .filter(|&days| chrono::TimeDelta::try_days(days).is_some())
                    .ok_or_else(|| layers.invalid("max_entry_age", "too large"))
            })
            .transpose()?;

        let digest = layers
            .own("digest")
            .map(|item| DigestConfig::from_item(layers, item))
            .transpose()?
            .flatten();

        Ok(Self {
            title: layers.string("title", layers.own("title"))?,
            category: layers
                .string("category", layers.get("category"))?
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            timezone,
            max_entry_num: layers
                .count("max_entry_num")?
                .map_or(defaults.max_entry_num, |n| n as usize),
            max_entry_age: max_entry_age.unwrap_or(defaults.max_entry_age),
            max_content_size: layers.count("max_content_size")?.map(|n| n as usize),
            max_image_width,
            full_content: layers.boolean("full_content")?.unwrap_or(defaults.full_content),
            sort: layers.boolean("sort")?.unwrap_or(defaults.sort),
            hide: layers.boolean("hide")?.unwrap_or(defaults.hide),
            date_format: layers.string("date_format", layers.get("date_format"))?,
            ignore: RuleSet::from_layers(layers, "ignore")?,
            strip: RuleSet::from_layers(layers, "strip")?,
            digest,
            ..defaults
        })
    }

    pub fn label(&self) -> &str {
        self.title
            .as_deref()
            .or(self.url.as_deref())
            .or(self.group.as_deref())
            .unwrap_or("<untitled>")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Title,
    Link,
    Content,
    Description,
    Author,
    Tags,
    Id,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Title => "title",
            Field::Link => "link",
            Field::Content => "content",
            Field::Description => "description",
            Field::Author => "author",
            Field::Tags => "tags",
            Field::Id => "id",
        }
    }
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "title" => Ok(Field::Title),
            "link" => Ok(Field::Link),
            "content" => Ok(Field::Content),
            "description" | "summary" => Ok(Field::Description),
            "author" => Ok(Field::Author),
            "tags" | "category" => Ok(Field::Tags),
            "id" | "guid" => Ok(Field::Id),
            other => Err(format!("unknown entry field `{}`", other)),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<Field, Regex>,
}

impl RuleSet {
    // a plain `field = "regex"` is a rule named after its field
    fn from_layers(layers: &Layers<'_>, key: &str) -> Result<Self, ConfigError> {
        let mut named: BTreeMap<String, Vec<(Field, Vec<String>)>> = BTreeMap::new();

        for table in &layers.tables {
            let Some(item) = table.get(key) else {
                continue;
            };
            let rules = item
                .as_table_like()
                .ok_or_else(|| layers.invalid(key, "expected a table of rules"))?;

            for (name, rule) in rules.iter() {
                let mut fields = Vec::new();
                match rule.as_table_like() {
                    Some(rule) => {
                        for (field, patterns) in rule.iter() {
                            fields.push((
                                parse_field(layers, key, field)?,
                                patterns_of(layers, key, patterns)?,
                            ));
                        }
                    }
                    None => fields.push((parse_field(layers, key, name)?, patterns_of(layers, key, rule)?)),
                }
                named.insert(name.to_string(), fields);
            }
        }

        let mut by_field: BTreeMap<Field, Vec<String>> = BTreeMap::new();
        for (field, patterns) in named.into_values().flatten() {
            by_field.entry(field).or_default().extend(patterns);
        }

        let mut rules = BTreeMap::new();
        for (field, patterns) in by_field {
            let rule_key = format!("{}.{}", key, field);
            for pattern in &patterns {
                Regex::new(pattern).map_err(|source| ConfigError::Regex {
                    context: layers.context.clone(),
                    key: rule_key.clone(),
                    source,
                })?;
            }
            let joined = patterns
                .iter()
                .map(|p| format!("(?:{})", p))
                .collect::<Vec<_>>()
                .join("|");
            let regex = Regex::new(&joined).map_err(|source| ConfigError::Regex {
                context: layers.context.clone(),
                key: rule_key,
                source,
            })?;
            rules.insert(field, regex);
        }

        Ok(Self { rules })
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, field: Field) -> Option<&Regex> {
        self.rules.get(&field)
    }

    pub fn first_match<'t>(&self, mut text: impl FnMut(Field) -> Cow<'t, str>) -> Option<Field> {
        self.rules
            .iter()
            .find(|(field, regex)| regex.is_match(&text(**field)))
            .map(|(field, _)| *field)
    }

    pub fn strip<'t>(&self, field: Field, text: &'t str) -> Cow<'t, str> {
        match self.rules.get(&field) {
            Some(regex) => regex.replace_all(text, ""),
            None => Cow::Borrowed(text),
        }
    }
}

fn parse_field(layers: &Layers<'_>, key: &str, name: &str) -> Result<Field, ConfigError> {
    name.parse().map_err(|message: String| layers.invalid(key, message))
}

fn patterns_of(layers: &Layers<'_>, key: &str, item: &Item) -> Result<Vec<String>, ConfigError> {
    if let Some(pattern) = item.as_str() {
        return Ok(vec![pattern.to_string()]);
    }
    item.as_array()
        .and_then(|patterns| {
            patterns
                .iter()
                .map(|p| p.as_str().map(str::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .ok_or_else(|| layers.invalid(key, "expected a regex or a list of regexes"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    Hour,
    Day,
    Week,
    Month,
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hour" => Ok(Interval::Hour),
            "day" => Ok(Interval::Day),
            "week" => Ok(Interval::Week),
            "month" => Ok(Interval::Month),
            other => Err(format!("unknown interval `{}` (expected hour, day, week or month)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IdRule {
    pub find: Regex,
    pub source: Field,
    pub link: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub interval: Interval,
    pub id: Option<IdRule>,
    pub partial: bool,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            interval: Interval::Day,
            id: None,
            partial: false,
        }
    }
}

impl DigestConfig {
    fn from_item(layers: &Layers<'_>, item: &Item) -> Result<Option<Self>, ConfigError> {
        if let Some(enabled) = item.as_bool() {
            return Ok(enabled.then(Self::default));
        }
        let table = item
            .as_table_like()
            .ok_or_else(|| layers.invalid("digest", "expected a table or a boolean"))?;

        let string = |key: &str| -> Result<Option<String>, ConfigError> {
            table
                .get(key)
                .map(|item| {
                    item.as_str()
                        .map(str::to_owned)
                        .ok_or_else(|| layers.invalid(&format!("digest.{}", key), "expected a string"))
                })
                .transpose()
        };

        let interval = match string("interval")? {
            Some(interval) => interval
                .parse()
                .map_err(|message: String| layers.invalid("digest.interval", message))?,
            None => Interval::Day,
        };

        let partial = match table.get("partial") {
            Some(item) => item
                .as_bool()
                .ok_or_else(|| layers.invalid("digest.partial", "expected true or false"))?,
            None => false,
        };

        let id = match string("id_find")? {
            None => None,
            Some(pattern) => {
                let find = Regex::new(&pattern).map_err(|source| ConfigError::Regex {
                    context: layers.context.clone(),
                    key: "digest.id_find".to_string(),
                    source,
                })?;
                let source = match string("id_source")? {
                    Some(name) => parse_field(layers, "digest.id_source", &name)?,
                    None => Field::Title,
                };
                if !matches!(source, Field::Link | Field::Title | Field::Content | Field::Description) {
                    return Err(layers.invalid("digest.id_source", "expected link, title or content"));
                }
                let link = string("link")?
                    .ok_or_else(|| layers.invalid("digest.link", "required with id_find"))?;
                let title = string("title")?
                    .ok_or_else(|| layers.invalid("digest.title", "required with id_find"))?;
                Some(IdRule {
                    find,
                    source,
                    link,
                    title,
                })
            }
        };

        Ok(Some(Self {
            interval,
            id,
            partial,
        }))
    }
}
