use std::fs;
use std::io;
use std::path::Path;

use askama::Template;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use crate::cache::write_atomically;
use crate::config::normalize_id;
use crate::feed::Node;

pub const OUTPUT_FILE: &str = "index.html";

#[derive(Template)]
#[template(path = "index.html")]
pub struct IndexTemplate {
    pub stylesheets: Vec<String>,
    pub feeds: Vec<FeedView>,
}

#[derive(Debug)]
pub struct FeedView {
    pub title: String,
    pub classes: String,
    pub entries: Vec<EntryView>,
}

#[derive(Debug)]
pub struct EntryView {
    pub classes: String,
    pub date: String,
    pub link: String,
    pub title: String,
    /// Already rewritten HTML, inserted unescaped.
    pub content: String,
}

/// Newest entries of `node` within its age and count limits.
pub fn feed_view(node: &Node, now: DateTime<Utc>) -> FeedView {
    let config = node.config();
    let category = normalize_id(&config.category);
    let max_age = Duration::try_days(config.max_entry_age).unwrap_or(Duration::MAX);

    let mut entries = Vec::new();
    for item in node.entries(now) {
        if entries.len() >= config.max_entry_num {
            break;
        }
        let timestamp = item.timestamp_or(now);
        let age = now - timestamp;
        if age > max_age {
            debug!("Skipping {:?}: older than {} days", item.title(), config.max_entry_age);
            continue;
        }

        let mut classes = vec!["entry"];
        if !category.is_empty() {
            classes.push(&category);
        }
        if age < Duration::days(1) {
            classes.push("today");
        }
        if age < Duration::days(7) {
            classes.push("thisweek");
        }

        entries.push(EntryView {
            classes: classes.join(" "),
            date: timestamp.with_timezone(&config.timezone).format("%b %d").to_string(),
            link: item.link().to_string(),
            title: item.title().to_string(),
            content: item.content().to_string(),
        });
    }

    FeedView {
        title: node.title(),
        classes: node.classes().into_iter().collect::<Vec<_>>().join(" "),
        entries,
    }
}

pub fn copy_stylesheets(input_dir: &Path, output_dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(input_dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("css") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            continue;
        };
        write_atomically(&output_dir.join(&name), &fs::read(&path)?)?;
        debug!("Copied {}", name);
        names.push(name);
    }
    names.sort();
    Ok(names)
}

pub fn write_page(output_dir: &Path, page: &IndexTemplate) -> anyhow::Result<()> {
    let html = page.render()?;
    let path = output_dir.join(OUTPUT_FILE);
    write_atomically(&path, html.as_bytes())?;
    info!(
        "Wrote {} ({} feeds, {} entries)",
        path.display(),
        page.feeds.len(),
        page.feeds.iter().map(|f| f.entries.len()).sum::<usize>()
    );
    Ok(())
}
