use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tonguefish::pipeline::{self, Options, DEFAULT_JOBS};
use tonguefish::retrieval::RetrievalOptions;

/// Aggregate syndication feeds into a single static page.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Directory holding feeds.toml and stylesheets
    input_dir: PathBuf,

    /// Directory the page is written to
    output_dir: PathBuf,

    /// Directory for cached feed documents
    cache_dir: PathBuf,

    /// Use cached copies without checking for updates
    #[arg(long)]
    no_update: bool,

    /// Skip feeds that have never been fetched
    #[arg(long)]
    no_new: bool,

    /// Number of feeds fetched at once
    #[arg(short, long, default_value_t = DEFAULT_JOBS)]
    jobs: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tonguefish=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let options = Options {
        input_dir: args.input_dir,
        output_dir: args.output_dir,
        cache_dir: args.cache_dir,
        retrieval: RetrievalOptions {
            no_update: args.no_update,
            no_new: args.no_new,
        },
        jobs: args.jobs,
    };

    let summary = pipeline::run(&options).await?;
    info!(
        "Done: {} feeds rendered, {} failed, {} problems reported, {} cache entries evicted{}",
        summary.rendered,
        summary.failed,
        summary.errors,
        summary.evicted,
        if summary.config_saved { ", configuration updated" } else { "" }
    );

    Ok(())
}
