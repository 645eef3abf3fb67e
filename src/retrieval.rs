use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::document::CachedDocument;
use crate::error::RetrievalError;
use crate::feed::Feed;
use crate::fetcher::{FetchStatus, FetchedFeed, Fetcher};
use crate::report::ErrorReport;

#[derive(Debug, Clone, Copy, Default)]
pub struct RetrievalOptions {
    pub no_update: bool,
    pub no_new: bool,
}

pub struct FetchContext<'a> {
    pub fetcher: &'a Fetcher,
    pub cache: &'a Cache,
    pub config: &'a Mutex<Config>,
    pub report: &'a ErrorReport,
    pub options: RetrievalOptions,
}

/// Brings `feed` up to date, returning the document to build entries from.
pub async fn fetch_or_refresh(
    feed: &mut Feed,
    ctx: &FetchContext<'_>,
) -> Result<Arc<CachedDocument>, RetrievalError> {
    let url = feed.url().ok_or(RetrievalError::NoUrl)?.to_string();

    let cached = match ctx.cache.get(&url) {
        Ok(cached) => cached,
        Err(e) => {
            warn!("Ignoring cached copy of {}: {}", url, e);
            None
        }
    };

    let cached = match cached {
        Some(document) if ctx.options.no_update => {
            debug!("{}: using cached copy without checking", url);
            return Ok(Arc::new(document));
        }
        None if ctx.options.no_new => return Err(RetrievalError::NotCached),
        other => other,
    };

    let fetched = ctx
        .fetcher
        .fetch(&url, cached.as_ref().map(|d| &d.validation))
        .await?;
    debug!("{}: {:?} (HTTP {})", url, fetched.status, fetched.http_status);

    let document = match fetched.status {
        FetchStatus::Success => store(ctx, &url, fetched, None),
        FetchStatus::NotModified => cached.ok_or(RetrievalError::Status(304))?,
        FetchStatus::TemporaryRedirect => {
            if fetched.has_body() {
                store(ctx, &url, fetched, None)
            } else {
                cached.ok_or_else(|| RetrievalError::EmptyRedirect(fetched.url.clone()))?
            }
        }
        FetchStatus::PermanentRedirect => {
            let new_url = fetched.url.clone();
            info!("{} moved permanently to {}", url, new_url);
            feed.update_url(ctx.config, &new_url)?;

            if fetched.has_body() {
                store(ctx, &new_url, fetched, Some(&url))
            } else {
                let document =
                    cached.ok_or_else(|| RetrievalError::EmptyRedirect(new_url.clone()))?;
                ctx.cache.put(&new_url, document, Some(&url))
            }
        }
        FetchStatus::Gone => {
            warn!("{} is gone, disabling it", url);
            feed.disable_url(ctx.config)?;
            return Err(RetrievalError::Gone);
        }
        FetchStatus::Other(code) => return Err(RetrievalError::Status(code)),
    };

    Ok(Arc::new(document))
}

fn store(ctx: &FetchContext<'_>, url: &str, fetched: FetchedFeed, old_url: Option<&str>) -> CachedDocument {
    let document = ctx.cache.put(url, fetched, old_url);
    if document.bozo {
        ctx.report.record(format!(
            "{}: stripping error {} before caching",
            url,
            document.bozo_message.as_deref().unwrap_or("(no message)")
        ));
    }
    document
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedConfig;
    use crate::document::{RawEntry, ValidationTag};
    use tempfile::TempDir;
    use wiremock::matchers::{header, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Fresh</title>
    <item><title>New</title><link>https://example.com/new</link></item>
</channel></rss>"#;

    struct Harness {
        _dir: TempDir,
        fetcher: Fetcher,
        cache: Cache,
        config: Mutex<Config>,
        report: ErrorReport,
        feed: Feed,
    }

    impl Harness {
        fn new(url: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let text = format!("[[feeds]]\ntitle = \"Test\"\nurl = \"{}\"\n", url);
            let config = Config::from_str(&text).unwrap();
            let (index, table) = config.feeds().next().unwrap();
            let feed = Feed::new(FeedConfig::for_feed(&config, index, table).unwrap());

            Self {
                fetcher: Fetcher::new().unwrap(),
                cache: Cache::open(dir.path()).unwrap(),
                config: Mutex::new(config),
                report: ErrorReport::new(),
                feed,
                _dir: dir,
            }
        }

        async fn run(&mut self, options: RetrievalOptions) -> Result<Arc<CachedDocument>, RetrievalError> {
            let ctx = FetchContext {
                fetcher: &self.fetcher,
                cache: &self.cache,
                config: &self.config,
                report: &self.report,
                options,
            };
            fetch_or_refresh(&mut self.feed, &ctx).await
        }

        fn seed(&self, url: &str, title: &str, etag: Option<&str>) {
            let document = CachedDocument {
                title: Some(title.to_string()),
                status: 200,
                validation: ValidationTag {
                    etag: etag.map(str::to_string),
                    last_modified: None,
                },
                entries: vec![RawEntry {
                    id: "old".to_string(),
                    title: Some("Old".to_string()),
                    link: Some("https://example.com/old".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            };
            self.cache.put(url, document, None);
        }

        fn config_text(&self) -> String {
            self.config.lock().unwrap().to_string()
        }
    }

    mod state_tests {
        use super::*;

        #[tokio::test]
        async fn test_fresh_content_is_cached() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert_eq!(document.title.as_deref(), Some("Fresh"));
            assert_eq!(document.url, url);
            assert!(harness.cache.get(&url).unwrap().is_some());
        }

        #[tokio::test]
        async fn test_not_modified_uses_cache() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .and(header("If-None-Match", "\"v1\""))
                .respond_with(ResponseTemplate::new(304))
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);
            harness.seed(&url, "Cached", Some("\"v1\""));

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert_eq!(document.title.as_deref(), Some("Cached"));
        }

        #[tokio::test]
        async fn test_not_modified_without_cache_fails() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(304))
                .mount(&server)
                .await;
            let mut harness = Harness::new(&format!("{}/feed", server.uri()));

            let result = harness.run(RetrievalOptions::default()).await;

            assert!(matches!(result, Err(RetrievalError::Status(304))));
        }

        #[tokio::test]
        async fn test_no_update_skips_network() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(500))
                .expect(0)
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);
            harness.seed(&url, "Cached", None);

            let options = RetrievalOptions {
                no_update: true,
                no_new: false,
            };
            let document = harness.run(options).await.unwrap();

            assert_eq!(document.title.as_deref(), Some("Cached"));
        }

        #[tokio::test]
        async fn test_no_new_refuses_uncached_feed() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
                .expect(0)
                .mount(&server)
                .await;
            let mut harness = Harness::new(&format!("{}/feed", server.uri()));

            let options = RetrievalOptions {
                no_update: false,
                no_new: true,
            };
            let result = harness.run(options).await;

            assert!(matches!(result, Err(RetrievalError::NotCached)));
        }

        #[tokio::test]
        async fn test_other_status_fails_feed() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(503))
                .mount(&server)
                .await;
            let mut harness = Harness::new(&format!("{}/feed", server.uri()));

            let result = harness.run(RetrievalOptions::default()).await;

            assert!(matches!(result, Err(RetrievalError::Status(503))));
        }

        #[tokio::test]
        async fn test_malformed_document_is_cached_and_reported() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(200).set_body_string("<not valid xml"))
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert!(document.bozo);
            assert!(document.entries.is_empty());
            let lines = harness.report.lines();
            assert_eq!(lines.len(), 1);
            assert!(lines[0].starts_with(&format!("{}: stripping error ", url)));
        }

        #[tokio::test]
        async fn test_clean_document_is_not_reported() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
                .mount(&server)
                .await;
            let mut harness = Harness::new(&format!("{}/feed", server.uri()));

            harness.run(RetrievalOptions::default()).await.unwrap();

            assert!(harness.report.lines().is_empty());
        }
    }

    mod redirect_tests {
        use super::*;

        #[tokio::test]
        async fn test_temporary_redirect_keeps_url() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(302).insert_header("Location", "/elsewhere"))
                .mount(&server)
                .await;
            Mock::given(path("/elsewhere"))
                .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert_eq!(document.url, url);
            assert_eq!(harness.feed.url(), Some(url.as_str()));
            assert!(!harness.config_text().contains("moved permanently"));
        }

        #[tokio::test]
        async fn test_empty_temporary_redirect_falls_back_to_cache() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(307).insert_header("Location", "/elsewhere"))
                .mount(&server)
                .await;
            Mock::given(path("/elsewhere"))
                .respond_with(ResponseTemplate::new(304))
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);
            harness.seed(&url, "Cached", None);

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert_eq!(document.title.as_deref(), Some("Cached"));
        }

        #[tokio::test]
        async fn test_permanent_redirect_rewrites_config_and_cache() {
            let server = MockServer::start().await;
            Mock::given(path("/old"))
                .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
                .mount(&server)
                .await;
            Mock::given(path("/new"))
                .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
                .mount(&server)
                .await;
            let old = format!("{}/old", server.uri());
            let new = format!("{}/new", server.uri());
            let mut harness = Harness::new(&old);
            harness.seed(&old, "Cached", None);

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert_eq!(document.url, new);
            assert_eq!(harness.feed.url(), Some(new.as_str()));
            assert!(harness.cache.is_seen(&new));
            assert!(!harness.cache.is_seen(&old));

            let text = harness.config_text();
            assert!(text.contains(&format!("url = \"{}\"", new)));
            assert!(text.contains(&format!("moved permanently from {}", old)));
            assert!(harness.config.lock().unwrap().is_dirty());
        }

        #[tokio::test]
        async fn test_empty_permanent_redirect_moves_cached_copy() {
            let server = MockServer::start().await;
            Mock::given(path("/old"))
                .respond_with(ResponseTemplate::new(308).insert_header("Location", "/new"))
                .mount(&server)
                .await;
            Mock::given(path("/new"))
                .respond_with(ResponseTemplate::new(304))
                .mount(&server)
                .await;
            let old = format!("{}/old", server.uri());
            let new = format!("{}/new", server.uri());
            let mut harness = Harness::new(&old);
            harness.seed(&old, "Cached", None);

            let document = harness.run(RetrievalOptions::default()).await.unwrap();

            assert_eq!(document.title.as_deref(), Some("Cached"));
            assert_eq!(
                harness.cache.get(&new).unwrap().unwrap().title.as_deref(),
                Some("Cached")
            );
        }

        #[tokio::test]
        async fn test_empty_redirect_without_cache_fails() {
            let server = MockServer::start().await;
            Mock::given(path("/old"))
                .respond_with(ResponseTemplate::new(301).insert_header("Location", "/new"))
                .mount(&server)
                .await;
            Mock::given(path("/new"))
                .respond_with(ResponseTemplate::new(200))
                .mount(&server)
                .await;
            let mut harness = Harness::new(&format!("{}/old", server.uri()));

            let result = harness.run(RetrievalOptions::default()).await;

            assert!(matches!(result, Err(RetrievalError::EmptyRedirect(_))));
        }

        #[tokio::test]
        async fn test_gone_disables_url() {
            let server = MockServer::start().await;
            Mock::given(path("/feed"))
                .respond_with(ResponseTemplate::new(410))
                .mount(&server)
                .await;
            let url = format!("{}/feed", server.uri());
            let mut harness = Harness::new(&url);

            let result = harness.run(RetrievalOptions::default()).await;

            assert!(matches!(result, Err(RetrievalError::Gone)));
            assert_eq!(harness.feed.url(), None);
            let text = harness.config_text();
            assert!(text.contains(&format!("url_disabled = \"{}\"", url)));
            assert!(text.contains("gone (HTTP 410)"));
        }
    }
}
