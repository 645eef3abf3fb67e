use std::path::PathBuf;

use thiserror::Error;

/// Malformed or unusable configuration. Fatal: the run aborts before any fetch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml_edit::TomlError),

    #[error("invalid `{key}` in {context}: {message}")]
    Invalid {
        context: String,
        key: String,
        message: String,
    },

    #[error("invalid regex for `{key}` in {context}: {source}")]
    Regex {
        context: String,
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("no feed at position {0} in configuration")]
    MissingFeed(usize),

    #[error("`{0}` has no url of its own")]
    NoUrl(String),

    #[error("configuration was not loaded from a file")]
    NoPath,

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One feed could not be retrieved this run. The feed is skipped; the run goes on.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("feed has no url configured")]
    NoUrl,

    #[error("not cached and fetching new feeds is disabled")]
    NotCached,

    #[error("invalid url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("redirect without a usable Location header")]
    MissingLocation,

    #[error("more than {0} redirects")]
    TooManyRedirects(usize),

    #[error("redirect to {0} carried no content and nothing is cached")]
    EmptyRedirect(String),

    #[error("feed is gone (HTTP 410); its url has been disabled")]
    Gone,

    #[error("none of the feeds in group `{0}` could be fetched")]
    NoMembers(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One entry (or one tag inside it) could not be processed. Only that piece is skipped.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("entry {0:?} has no link")]
    MissingLink(String),

    #[error("malformed <{0}> tag")]
    MalformedTag(String),

    #[error("invalid url {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cached document {path} is unreadable: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize document: {0}")]
    Serialize(#[from] serde_json::Error),
}
