use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use interfaces::{Article, ArticleKey, FeedSource, RawItem, Task};
use sha2::{Digest as _, Sha256};
use tracing::{error, info, warn};

use crate::retry::{with_retry, RetryPolicy};
use crate::store::ArticleStore;
use crate::types::Result;

/// Result of the fetch stage for one run.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Articles not seen before, already persisted to the store.
    pub articles: Vec<Article>,
    pub fetched: u64,
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    /// (source id, error) per failed source.
    pub failures: Vec<(String, String)>,
}

impl FetchOutcome {
    /// A stage with at least one feed where every feed failed is a stage
    /// failure; anything less is partial at worst.
    pub fn all_sources_failed(&self) -> bool {
        self.sources_attempted > 0 && self.sources_succeeded == 0
    }

    pub fn detail(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|(source, err)| format!("source {}: {}", source, err))
            .collect()
    }
}

/// Pull every feed of the task, normalize the results, and persist the
/// unseen articles.
///
/// A failing source never aborts its siblings: its error is recorded and the
/// stage proceeds. Each new article is appended to the store the moment it is
/// recognized as new, so a crash mid-run neither loses nor re-processes work.
pub async fn run_fetch(
    task: &Task,
    sources: &HashMap<String, Arc<dyn FeedSource>>,
    store: &ArticleStore,
    policy: &RetryPolicy,
    since: Option<DateTime<Utc>>,
) -> Result<FetchOutcome> {
    let mut outcome = FetchOutcome {
        sources_attempted: task.feeds.len(),
        ..Default::default()
    };

    for feed in &task.feeds {
        let Some(source) = sources.get(&feed.kind) else {
            warn!(
                "task '{}': no feed source registered for kind '{}'",
                task.name, feed.kind
            );
            outcome.failures.push((
                feed.source_id.clone(),
                format!("no feed source for kind '{}'", feed.kind),
            ));
            continue;
        };

        let label = format!("fetch {}", feed.source_id);
        let items = match with_retry(policy, &label, || source.fetch(feed, since)).await {
            Ok(items) => items,
            Err(e) => {
                error!("task '{}': source {} failed: {}", task.name, feed.source_id, e);
                outcome.failures.push((feed.source_id.clone(), e.to_string()));
                continue;
            }
        };

        outcome.sources_succeeded += 1;
        outcome.fetched += items.len() as u64;

        for raw in items {
            let article = normalize(&feed.source_id, &feed.labels, raw);
            // Append immediately; novelty is decided by the store's unique
            // (source id, dedup key) constraint.
            if store.insert_if_new(&article).await? {
                outcome.articles.push(article);
            }
        }
    }

    info!(
        "task '{}': fetch done, {} fetched / {} new / {} of {} sources failed",
        task.name,
        outcome.fetched,
        outcome.articles.len(),
        outcome.failures.len(),
        outcome.sources_attempted,
    );
    Ok(outcome)
}

/// Normalize a raw item into an article. The dedup key prefers the feed's
/// own guid, then the canonical URL, then a content hash.
fn normalize(source_id: &str, labels: &[String], raw: RawItem) -> Article {
    let dedup_key = match raw.guid {
        Some(guid) if !guid.is_empty() => guid,
        _ if !raw.url.is_empty() => raw.url.clone(),
        _ => content_hash(&raw.title, &raw.body),
    };

    Article {
        key: ArticleKey {
            source_id: source_id.to_string(),
            dedup_key,
        },
        url: raw.url,
        title: raw.title,
        body: raw.body,
        labels: labels.to_vec(),
        published_at: raw.published_at,
        first_seen: Utc::now(),
    }
}

fn content_hash(title: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update(b"\0");
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}
