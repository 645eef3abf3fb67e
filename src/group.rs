use std::cmp::Reverse;
use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, error};

use crate::config::FeedConfig;
use crate::entry::Item;
use crate::error::RetrievalError;
use crate::feed::{base_classes, Node};
use crate::retrieval::FetchContext;

/// Members of one group fetched at the same time.
const MEMBER_CONCURRENCY: usize = 4;

#[derive(Debug)]
pub struct Group {
    id: String,
    config: FeedConfig,
    members: Vec<Node>,
}

impl Group {
    pub fn new(id: String, config: FeedConfig) -> Self {
        Self {
            id,
            config,
            members: Vec::new(),
        }
    }

    pub fn push(&mut self, member: Node) {
        self.members.push(member);
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    #[cfg(test)]
    pub(crate) fn members(&self) -> &[Node] {
        &self.members
    }

    /// Members that fail are dropped; the group fails only when none are left.
    pub async fn fetch(&mut self, ctx: &FetchContext<'_>) -> Result<(), RetrievalError> {
        // collected first so the stream holds concrete futures, keeping it Send
        let fetches: Vec<_> = self.members.iter_mut().map(|member| member.fetch(ctx)).collect();
        let results: Vec<_> = stream::iter(fetches)
            .buffered(MEMBER_CONCURRENCY)
            .collect()
            .await;

        let members = std::mem::take(&mut self.members);
        for (member, result) in members.into_iter().zip(results) {
            match result {
                Ok(()) => self.members.push(member),
                Err(e) => {
                    error!("Dropping '{}' from group '{}': {}", member.title(), self.id, e);
                    ctx.report.record(format!("{}: {}", member.identity(), e));
                }
            }
        }

        if self.members.is_empty() {
            return Err(RetrievalError::NoMembers(self.id.clone()));
        }
        Ok(())
    }

    pub fn title(&self) -> String {
        self.config.title.clone().unwrap_or_else(|| self.id.clone())
    }

    pub fn classes(&self) -> BTreeSet<String> {
        let mut classes = base_classes("group", &self.config);
        classes.insert(self.id.clone());
        classes
    }

    pub fn entries(&self, now: DateTime<Utc>) -> Vec<Item> {
        let mut links = HashSet::new();
        let mut items: Vec<Item> = self
            .members
            .iter()
            .flat_map(|member| member.entries(now))
            .filter(|item| {
                let fresh = links.insert(item.link().to_string());
                if !fresh {
                    debug!("Group '{}': duplicate {}", self.id, item.link());
                }
                fresh
            })
            .collect();

        items.sort_by_cached_key(|item| Reverse(item.timestamp_or(now)));
        items
    }
}
