//! Integration tests for the tonguefish feed aggregator
//!
//! These tests drive whole runs against a mock HTTP server, from loading
//! feeds.toml through fetching, rendering, cache pruning and saving
//! configuration corrections.

use std::fs;

mod common {
    use std::fs;
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use tempfile::TempDir;
    use tonguefish::pipeline::Options;
    use tonguefish::retrieval::RetrievalOptions;

    /// Input, output and cache directories for one test.
    pub struct Workspace {
        pub root: TempDir,
    }

    impl Workspace {
        pub fn new(config: &str) -> Self {
            let root = tempfile::tempdir().expect("Failed to create temp directory");
            for dir in ["input", "output", "cache"] {
                fs::create_dir(root.path().join(dir)).unwrap();
            }
            fs::write(root.path().join("input/feeds.toml"), config).unwrap();
            fs::write(root.path().join("input/style.css"), "body { margin: 0; }").unwrap();
            Self { root }
        }

        pub fn path(&self, name: &str) -> PathBuf {
            self.root.path().join(name)
        }

        pub fn options(&self, retrieval: RetrievalOptions) -> Options {
            Options {
                input_dir: self.path("input"),
                output_dir: self.path("output"),
                cache_dir: self.path("cache"),
                retrieval,
                jobs: 4,
            }
        }

        pub fn config_text(&self) -> String {
            fs::read_to_string(self.path("input/feeds.toml")).unwrap()
        }

        pub fn page(&self) -> String {
            fs::read_to_string(self.path("output/index.html")).unwrap()
        }
    }

    /// An RSS document whose items were published `hours` ago.
    pub fn rss(title: &str, items: &[(&str, &str, i64)]) -> String {
        let items: String = items
            .iter()
            .map(|(title, link, hours)| {
                format!(
                    "<item><title>{}</title><link>{}</link><guid>{}</guid>\
                     <pubDate>{}</pubDate><description>&lt;p&gt;{} text&lt;/p&gt;</description></item>",
                    title,
                    link,
                    link,
                    (Utc::now() - Duration::hours(*hours)).to_rfc2822(),
                    title
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{}</title><link>https://example.com/</link>{}</channel></rss>"#,
            title, items
        )
    }
}

#[cfg(test)]
mod config_integration_tests {
    use super::*;
    use tonguefish::config::Config;
    use tonguefish::feed::{build_nodes, Node};

    #[test]
    fn test_load_demo_feeds_config() {
        let config = Config::load("demo/feeds.toml");
        assert!(config.is_ok(), "Failed to load demo/feeds.toml: {:?}", config.err());

        let nodes = build_nodes(&config.unwrap()).unwrap();
        assert!(!nodes.is_empty(), "demo/feeds.toml should have at least one feed");
        assert!(nodes.iter().any(|n| matches!(n, Node::Group(_))));
    }

    #[test]
    fn test_unchanged_config_is_not_rewritten() {
        let workspace = common::Workspace::new("# keep me\n[[feeds]]\nurl = \"https://example.com/\"\n");
        let path = workspace.path("input/feeds.toml");
        let before = fs::metadata(&path).unwrap().modified().unwrap();

        let mut config = Config::load(&path).unwrap();
        assert!(!config.save().unwrap());

        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);
        assert_eq!(workspace.config_text(), "# keep me\n[[feeds]]\nurl = \"https://example.com/\"\n");
    }
}

#[cfg(test)]
mod end_to_end_tests {
    use super::common::{rss, Workspace};
    use super::*;
    use tonguefish::cache::Cache;
    use tonguefish::pipeline;
    use tonguefish::retrieval::RetrievalOptions;
    use wiremock::matchers::path;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount(server: &MockServer, at: &str, response: ResponseTemplate) {
        Mock::given(path(at)).respond_with(response).mount(server).await;
    }

    fn feeds_toml(base: &str) -> String {
        format!(
            r#"# Reading list
timezone = "UTC"

[groups.planets]
title = "Planets"

[[feeds]]
title = "Alpha"
url = "{base}/alpha"
max_entry_num = 2

[[feeds]]
title = "Moved"
url = "{base}/old"  # will move

[[feeds]]
title = "Dead"
url = "{base}/dead"

[[feeds]]
title = "Mars"
url = "{base}/mars"
group = "planets"

[[feeds]]
title = "Venus"
url = "{base}/venus"
group = "planets"

[[feeds]]
title = "Daily"
url = "{base}/daily"
digest = true

[[feeds]]
title = "Hidden"
url = "{base}/hidden"
hide = true
"#
        )
    }

    async fn mock_feeds(server: &MockServer) {
        mount(
            server,
            "/alpha",
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"alpha-1\"")
                .set_body_string(rss(
                    "Alpha Feed",
                    &[
                        ("Alpha one", "https://alpha.example/1", 1),
                        ("Alpha two", "https://alpha.example/2", 2),
                        ("Alpha three", "https://alpha.example/3", 3),
                    ],
                )),
        )
        .await;
        mount(
            server,
            "/old",
            ResponseTemplate::new(301).insert_header("Location", "/new"),
        )
        .await;
        mount(
            server,
            "/new",
            ResponseTemplate::new(200).set_body_string(rss(
                "Moved Feed",
                &[("Relocated post", "https://moved.example/1", 1)],
            )),
        )
        .await;
        mount(server, "/dead", ResponseTemplate::new(410)).await;
        mount(
            server,
            "/mars",
            ResponseTemplate::new(200).set_body_string(rss(
                "Mars",
                &[
                    ("Red planet", "https://planets.example/red", 5),
                    ("Shared news", "https://planets.example/shared", 6),
                ],
            )),
        )
        .await;
        mount(server, "/venus", ResponseTemplate::new(500)).await;
        mount(
            server,
            "/daily",
            ResponseTemplate::new(200).set_body_string(rss(
                "Daily",
                &[
                    ("Morning", "https://daily.example/1", 1),
                    ("Evening", "https://daily.example/2", 2),
                ],
            )),
        )
        .await;
        mount(
            server,
            "/hidden",
            ResponseTemplate::new(200).set_body_string(rss(
                "Hidden",
                &[("Secret", "https://hidden.example/1", 1)],
            )),
        )
        .await;
    }

    #[tokio::test]
    async fn test_full_run() {
        let server = MockServer::start().await;
        mock_feeds(&server).await;
        let workspace = Workspace::new(&feeds_toml(&server.uri()));
        fs::write(workspace.path("cache/stale"), b"{}").unwrap();

        let summary = pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();

        // Dead fails; Venus is dropped from its group without failing it
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rendered, 4);
        assert_eq!(summary.evicted, 1);
        assert!(summary.config_saved);
        assert_eq!(summary.errors, 2);

        let page = workspace.page();
        assert!(page.contains("Alpha one"));
        assert!(page.contains("Alpha two"));
        assert!(!page.contains("Alpha three"), "max_entry_num should cap the feed");
        assert!(page.contains("Relocated post"));
        assert!(page.contains("Red planet"));
        assert!(page.contains("Planets"));
        assert!(page.contains("digest"));
        assert!(!page.contains("Secret"), "hidden feeds are not rendered");
        assert!(page.contains("loading=\"lazy\"") || !page.contains("<img"));
        assert!(workspace.path("output/style.css").exists());
        assert!(!workspace.path("cache/stale").exists());

        let config = workspace.config_text();
        let base = server.uri();
        assert!(config.starts_with("# Reading list\n"));
        assert!(config.contains(&format!("url = \"{}/new\" # moved permanently from {}/old", base, base)));
        assert!(config.contains(&format!("url_disabled = \"{}/dead\" # gone (HTTP 410)", base)));
        assert!(config.contains(&format!("url = \"{}/alpha\"", base)));

        let cache = Cache::open(workspace.path("cache")).unwrap();
        assert!(cache.get(&format!("{}/new", base)).unwrap().is_some());
        assert!(cache.get(&format!("{}/old", base)).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_run_without_updates_uses_cache() {
        let server = MockServer::start().await;
        mock_feeds(&server).await;
        let workspace = Workspace::new(&feeds_toml(&server.uri()));

        pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();
        let requests_after_first = server.received_requests().await.unwrap().len();

        let options = RetrievalOptions {
            no_update: true,
            no_new: true,
        };
        let summary = pipeline::run(&workspace.options(options)).await.unwrap();

        // Dead is disabled now, and Venus never made it into the cache
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.rendered, 4);
        assert!(!summary.config_saved);
        assert_eq!(
            server.received_requests().await.unwrap().len(),
            requests_after_first,
            "no request should reach the server"
        );
        assert!(workspace.page().contains("Relocated post"));
    }

    #[tokio::test]
    async fn test_not_modified_reuses_cached_entries() {
        let server = MockServer::start().await;
        let toml = format!("[[feeds]]\ntitle = \"Alpha\"\nurl = \"{}/alpha\"\n", server.uri());
        let workspace = Workspace::new(&toml);

        Mock::given(path("/alpha"))
            .and(wiremock::matchers::header("If-None-Match", "\"alpha-1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        mount(
            &server,
            "/alpha",
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"alpha-1\"")
                .set_body_string(rss("Alpha Feed", &[("Only once", "https://alpha.example/1", 1)])),
        )
        .await;

        pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();
        let first = workspace.page();

        let summary = pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();

        assert_eq!(summary.failed, 0);
        assert!(workspace.page().contains("Only once"));
        assert_eq!(first, workspace.page());
    }

    #[tokio::test]
    async fn test_malformed_config_aborts_before_fetching() {
        let server = MockServer::start().await;
        let workspace = Workspace::new("[[feeds]\nurl = ");

        let result = pipeline::run(&workspace.options(RetrievalOptions::default())).await;

        assert!(result.is_err());
        assert!(server.received_requests().await.unwrap().is_empty());
        assert!(!workspace.path("output/index.html").exists());
    }

    #[tokio::test]
    async fn test_group_with_no_reachable_members_is_left_out() {
        let server = MockServer::start().await;
        mount(&server, "/a", ResponseTemplate::new(500)).await;
        mount(&server, "/b", ResponseTemplate::new(404)).await;
        let toml = format!(
            "[[feeds]]\nurl = \"{0}/a\"\ngroup = \"lost\"\n\n[[feeds]]\nurl = \"{0}/b\"\ngroup = \"lost\"\n",
            server.uri()
        );
        let workspace = Workspace::new(&toml);

        let summary = pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rendered, 0);
        assert!(workspace.page().contains("<main>"));
    }

    #[tokio::test]
    async fn test_errors_file_lists_problems_of_this_run() {
        let server = MockServer::start().await;
        mount(&server, "/broken", ResponseTemplate::new(200).set_body_string("<not valid xml")).await;
        mount(&server, "/missing", ResponseTemplate::new(404)).await;
        let toml = format!(
            "[[feeds]]\nurl = \"{0}/broken\"\n\n[[feeds]]\nurl = \"{0}/missing\"\n",
            server.uri()
        );
        let workspace = Workspace::new(&toml);
        fs::write(workspace.path("output/errors"), "stale line from last time\n").unwrap();

        let summary = pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors, 2);
        let errors = fs::read_to_string(workspace.path("output/errors")).unwrap();
        let base = server.uri();
        assert!(!errors.contains("stale line"));
        assert!(errors
            .lines()
            .any(|line| line.starts_with(&format!("{}/broken: stripping error ", base))
                && line.ends_with(" before caching")));
        assert!(errors.contains(&format!("{}/missing: HTTP status 404", base)));
        assert_eq!(errors.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_clean_run_removes_old_errors_file() {
        let server = MockServer::start().await;
        mount(
            &server,
            "/alpha",
            ResponseTemplate::new(200)
                .set_body_string(rss("Alpha Feed", &[("Fine", "https://alpha.example/1", 1)])),
        )
        .await;
        let workspace = Workspace::new(&format!("[[feeds]]\nurl = \"{}/alpha\"\n", server.uri()));
        fs::write(workspace.path("output/errors"), "stale line from last time\n").unwrap();

        let summary = pipeline::run(&workspace.options(RetrievalOptions::default()))
            .await
            .unwrap();

        assert_eq!(summary.errors, 0);
        assert!(!workspace.path("output/errors").exists());
    }
}
