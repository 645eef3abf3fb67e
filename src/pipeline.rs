use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use chrono::Utc;
use futures::future;
use futures::stream::{self, StreamExt};
use tracing::{error, info};

use crate::cache::Cache;
use crate::config::{Config, CONFIG_FILE};
use crate::error::ConfigError;
use crate::feed::{build_nodes, Node};
use crate::fetcher::Fetcher;
use crate::render::{self, IndexTemplate};
use crate::report::ErrorReport;
use crate::retrieval::{FetchContext, RetrievalOptions};

pub const DEFAULT_JOBS: usize = 8;

#[derive(Debug, Clone)]
pub struct Options {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub retrieval: RetrievalOptions,
    pub jobs: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub rendered: usize,
    pub failed: usize,
    pub evicted: usize,
    pub config_saved: bool,
    pub errors: usize,
}

/// Only configuration and output errors abort the run. A feed that cannot be
/// fetched is logged, reported and left off the page.
pub async fn run(options: &Options) -> anyhow::Result<Summary> {
    ErrorReport::clear_previous(&options.output_dir)
        .context("failed to remove the previous errors file")?;
    let config = Config::load(options.input_dir.join(CONFIG_FILE))?;
    let mut nodes = build_nodes(&config)?;
    info!("Loaded {} feeds from configuration", nodes.len());

    let cache = Cache::open(&options.cache_dir)?;
    let fetcher = Fetcher::new().context("failed to create HTTP client")?;
    let config = Mutex::new(config);
    let report = ErrorReport::new();
    let ctx = FetchContext {
        fetcher: &fetcher,
        cache: &cache,
        config: &config,
        report: &report,
        options: options.retrieval,
    };

    let failed: HashSet<usize> = stream::iter(nodes.iter_mut().enumerate())
        .map(|(index, node)| {
            let ctx = &ctx;
            async move {
                match node.fetch(ctx).await {
                    Ok(()) => None,
                    Err(e) => {
                        error!("Failed to fetch '{}': {}", node.title(), e);
                        ctx.report.record(format!("{}: {}", node.identity(), e));
                        Some(index)
                    }
                }
            }
        })
        .buffer_unordered(options.jobs.max(1))
        .filter_map(future::ready)
        .collect()
        .await;

    let nodes: Vec<Node> = nodes
        .into_iter()
        .enumerate()
        .filter(|(index, _)| !failed.contains(index))
        .map(|(_, node)| node)
        .collect();

    fs::create_dir_all(&options.output_dir)
        .with_context(|| format!("failed to create {}", options.output_dir.display()))?;
    let now = Utc::now();
    let page = IndexTemplate {
        stylesheets: render::copy_stylesheets(&options.input_dir, &options.output_dir)
            .context("failed to copy stylesheets")?,
        feeds: nodes
            .iter()
            .filter(|node| !node.config().hide)
            .map(|node| render::feed_view(node, now))
            .collect(),
    };
    render::write_page(&options.output_dir, &page)?;
    let errors = report
        .write(&options.output_dir)
        .context("failed to write the errors file")?;

    let (evicted, config_saved) =
        finish(&cache, config.into_inner().unwrap_or_else(PoisonError::into_inner))?;

    Ok(Summary {
        rendered: page.feeds.len(),
        failed: failed.len(),
        evicted,
        config_saved,
        errors,
    })
}

/// Prunes the cache, then saves the configuration. A failed prune is logged
/// and the save still happens.
fn finish(cache: &Cache, mut config: Config) -> Result<(usize, bool), ConfigError> {
    let evicted = cache.clean().unwrap_or_else(|e| {
        error!("Failed to clean the cache: {}", e);
        0
    });
    Ok((evicted, config.save()?))
}
