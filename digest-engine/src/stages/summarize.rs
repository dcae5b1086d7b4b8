use std::collections::HashMap;

use interfaces::{AiBackend, Article, ArticleKey, ProcessedArticle, Task};
use tracing::{debug, info, warn};

use crate::retry::{with_retry, RetryPolicy};
use crate::store::ArticleStore;
use crate::types::Result;

/// Result of the filter/summarize stage for one run.
#[derive(Debug, Default)]
pub struct SummarizeOutcome {
    pub processed: Vec<ProcessedArticle>,
    pub excluded_by_tag: u64,
    pub summarized: u64,
    pub summarize_failed: u64,
    pub cache_hits: u64,
    pub batches_total: usize,
    pub batches_failed: usize,
}

impl SummarizeOutcome {
    /// The stage fails only when every AI batch failed.
    pub fn all_batches_failed(&self) -> bool {
        self.batches_total > 0 && self.batches_failed == self.batches_total
    }
}

/// Apply tag rules, then score and summarize the survivors through the AI
/// backend in batches.
///
/// Tag exclusion is authoritative and evaluated before any AI call: an
/// article carrying an excluded label is dropped here and can never be
/// resurrected by an AI verdict. A batch whose retry budget is exhausted
/// marks its articles "summarization failed" and excludes them; it does not
/// fail the stage unless every batch failed.
pub async fn run_summarize(
    task: &Task,
    mut articles: Vec<Article>,
    backend: &dyn AiBackend,
    store: &ArticleStore,
    policy: &RetryPolicy,
) -> Result<SummarizeOutcome> {
    let mut outcome = SummarizeOutcome::default();

    // Deterministic input order; AI score ties later resolve to the
    // earliest-published article.
    articles.sort_by_key(|a| a.published_at);

    // 1. Tag rules: cheap, local, authoritative.
    let mut survivors = Vec::new();
    for article in articles {
        match tag_decision(task, &article) {
            TagDecision::Excluded(tag) => {
                debug!("article {} excluded by tag '{}'", article.key, tag);
                outcome.excluded_by_tag += 1;
                outcome.processed.push(ProcessedArticle {
                    task_id: task.id,
                    included: false,
                    reason: format!("excluded by tag '{}'", tag),
                    score: 0.0,
                    summary: String::new(),
                    article,
                });
            }
            TagDecision::NotIncluded => {
                outcome.excluded_by_tag += 1;
                outcome.processed.push(ProcessedArticle {
                    task_id: task.id,
                    included: false,
                    reason: "no include tag matched".to_string(),
                    score: 0.0,
                    summary: String::new(),
                    article,
                });
            }
            TagDecision::Pass => survivors.push(article),
        }
    }

    // 2. Summary cache, when the task opts in.
    let mut to_score = Vec::new();
    if task.ai.cache_summaries {
        for article in survivors {
            match store.cached_summary(&article.key).await? {
                Some(cached) => {
                    outcome.cache_hits += 1;
                    outcome.summarized += 1;
                    outcome.processed.push(ProcessedArticle {
                        task_id: task.id,
                        included: cached.included && cached.score >= task.ai.min_score,
                        reason: cached.reason,
                        score: cached.score,
                        summary: cached.summary,
                        article,
                    });
                }
                None => to_score.push(article),
            }
        }
    } else {
        to_score = survivors;
    }

    // 3. Batched AI calls.
    let interests = audience_interests(task);
    let batch_size = task.ai.batch_size.max(1);
    for batch in to_score.chunks(batch_size) {
        outcome.batches_total += 1;
        let label = format!("ai batch ({} articles)", batch.len());
        match with_retry(policy, &label, || {
            backend.score_and_summarize(batch, &task.ai, &interests)
        })
        .await
        {
            Ok(verdicts) => {
                let mut by_key: HashMap<ArticleKey, _> =
                    verdicts.into_iter().map(|v| (v.key.clone(), v)).collect();
                for article in batch {
                    match by_key.remove(&article.key) {
                        Some(verdict) => {
                            outcome.summarized += 1;
                            if task.ai.cache_summaries {
                                store
                                    .cache_summary(
                                        &article.key,
                                        verdict.included,
                                        verdict.score,
                                        &verdict.summary,
                                        &verdict.reason,
                                    )
                                    .await?;
                            }
                            outcome.processed.push(ProcessedArticle {
                                task_id: task.id,
                                included: verdict.included && verdict.score >= task.ai.min_score,
                                reason: verdict.reason,
                                score: verdict.score,
                                summary: verdict.summary,
                                article: article.clone(),
                            });
                        }
                        None => {
                            // Backend returned no verdict for this article.
                            warn!("no verdict for article {}", article.key);
                            outcome.summarize_failed += 1;
                            outcome.processed.push(excluded_as_failed(
                                task,
                                article,
                                "backend returned no verdict",
                            ));
                        }
                    }
                }
            }
            Err(e) => {
                warn!("AI batch failed after retries: {}", e);
                outcome.batches_failed += 1;
                outcome.summarize_failed += batch.len() as u64;
                for article in batch {
                    outcome
                        .processed
                        .push(excluded_as_failed(task, article, &e.to_string()));
                }
            }
        }
    }

    // Score order with the earliest-published tie-break.
    outcome.processed.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.article.published_at.cmp(&b.article.published_at))
    });

    info!(
        "task '{}': summarize done, {} summarized ({} cached) / {} tag-excluded / {} failed",
        task.name, outcome.summarized, outcome.cache_hits, outcome.excluded_by_tag, outcome.summarize_failed,
    );
    Ok(outcome)
}

enum TagDecision {
    Pass,
    Excluded(String),
    NotIncluded,
}

fn tag_decision(task: &Task, article: &Article) -> TagDecision {
    for tag in &task.tag_rules.exclude {
        if article.labels.iter().any(|l| l.eq_ignore_ascii_case(tag)) {
            return TagDecision::Excluded(tag.clone());
        }
    }
    if !task.tag_rules.include.is_empty()
        && !task
            .tag_rules
            .include
            .iter()
            .any(|tag| article.labels.iter().any(|l| l.eq_ignore_ascii_case(tag)))
    {
        return TagDecision::NotIncluded;
    }
    TagDecision::Pass
}

/// Union of active recipients' interests; what the backend scores against.
fn audience_interests(task: &Task) -> Vec<String> {
    let mut interests: Vec<String> = Vec::new();
    for recipient in task.active_recipients() {
        for interest in &recipient.interests {
            if !interests.iter().any(|i| i.eq_ignore_ascii_case(interest)) {
                interests.push(interest.clone());
            }
        }
    }
    interests
}

/// Never deliver an article with a missing or garbage summary.
fn excluded_as_failed(task: &Task, article: &Article, error: &str) -> ProcessedArticle {
    ProcessedArticle {
        task_id: task.id,
        included: false,
        reason: format!("summarization failed: {}", error),
        score: 0.0,
        summary: String::new(),
        article: article.clone(),
    }
}
