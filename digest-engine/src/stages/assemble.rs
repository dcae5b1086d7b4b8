use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use interfaces::{Digest, ProcessedArticle, Recipient, Task};
use tracing::{debug, info};

/// Build one digest per active recipient from the run's included articles.
///
/// Pure function of its inputs. A recipient whose preferences match nothing
/// gets no digest (no "empty digest" email) unless the task explicitly asks
/// for empty-digest notifications.
pub fn assemble_digests(task: &Task, processed: &[ProcessedArticle], now: DateTime<Utc>) -> Vec<Digest> {
    let included: Vec<&ProcessedArticle> = processed.iter().filter(|p| p.included).collect();

    let mut digests = Vec::new();
    for recipient in task.active_recipients() {
        let mut items: Vec<&ProcessedArticle> = included
            .iter()
            .copied()
            .filter(|p| matches_interests(recipient, p))
            .collect();

        // Tag priority (recipient's interest order) first, then score,
        // then recency.
        items.sort_by(|a, b| {
            interest_rank(recipient, a)
                .cmp(&interest_rank(recipient, b))
                .then_with(|| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.article.published_at.cmp(&a.article.published_at))
        });
        items.truncate(task.delivery.max_items_per_digest);

        if items.is_empty() && !task.delivery.send_empty_digests {
            debug!(
                "task '{}': nothing matched for {}, no digest",
                task.name, recipient.address
            );
            continue;
        }

        digests.push(render(task, recipient, &items, now));
    }

    info!(
        "task '{}': assembled {} digest(s) from {} included article(s)",
        task.name,
        digests.len(),
        included.len()
    );
    digests
}

fn matches_interests(recipient: &Recipient, item: &ProcessedArticle) -> bool {
    if recipient.interests.is_empty() {
        return true;
    }
    recipient.interests.iter().any(|interest| {
        item.article
            .labels
            .iter()
            .any(|l| l.eq_ignore_ascii_case(interest))
    })
}

/// Position of the first matching interest; lower ranks sort first. Items
/// matching no listed interest (only possible with an empty interest list)
/// share the lowest priority.
fn interest_rank(recipient: &Recipient, item: &ProcessedArticle) -> usize {
    recipient
        .interests
        .iter()
        .position(|interest| {
            item.article
                .labels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(interest))
        })
        .unwrap_or(usize::MAX)
}

fn render(
    task: &Task,
    recipient: &Recipient,
    items: &[&ProcessedArticle],
    now: DateTime<Utc>,
) -> Digest {
    let date = now.format("%Y-%m-%d");
    let subject = format!("{} digest — {}", task.name, date);

    // Group by source for readability, as the original digests did.
    let mut by_source: BTreeMap<&str, Vec<&ProcessedArticle>> = BTreeMap::new();
    for item in items {
        by_source
            .entry(item.article.key.source_id.as_str())
            .or_default()
            .push(item);
    }

    let mut text = String::new();
    let mut html = String::new();
    text.push_str(&format!("{} — {}\n\n", task.name, date));
    html.push_str(&format!("<h1>{} — {}</h1>\n", task.name, date));

    if items.is_empty() {
        text.push_str("No new articles matched your interests this time.\n");
        html.push_str("<p>No new articles matched your interests this time.</p>\n");
    }

    for (source, entries) in &by_source {
        text.push_str(&format!("## {}\n\n", source));
        html.push_str(&format!("<h2>{}</h2>\n<ul>\n", source));
        for entry in entries {
            text.push_str(&format!(
                "- {}\n  {}\n  {}\n\n",
                entry.article.title, entry.summary, entry.article.url
            ));
            html.push_str(&format!(
                "<li><a href=\"{}\">{}</a><br/>{}</li>\n",
                entry.article.url, entry.article.title, entry.summary
            ));
        }
        html.push_str("</ul>\n");
    }

    text.push_str(&format!(
        "\nTo unsubscribe, reply with the subject \"Unsubscribe: {}\".\n",
        task.id
    ));
    html.push_str(&format!(
        "<p><small>To unsubscribe, reply with the subject \"Unsubscribe: {}\".</small></p>\n",
        task.id
    ));

    Digest {
        task_id: task.id,
        task_name: task.name.clone(),
        recipient: recipient.address.clone(),
        subject,
        body_text: text,
        body_html: html,
        item_keys: items.iter().map(|i| i.article.key.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::{ArticleKey, Article, CadenceSpec};
    use uuid::Uuid;

    fn task(recipients: Vec<Recipient>) -> Task {
        Task {
            id: Uuid::new_v4(),
            name: "daily".to_string(),
            enabled: true,
            feeds: Vec::new(),
            recipients,
            tag_rules: Default::default(),
            ai: Default::default(),
            cadence: CadenceSpec::Interval { minutes: 60 },
            delivery: Default::default(),
        }
    }

    fn processed(key: &str, labels: &[&str], score: f64, included: bool) -> ProcessedArticle {
        ProcessedArticle {
            article: Article {
                key: ArticleKey {
                    source_id: "feed-1".to_string(),
                    dedup_key: key.to_string(),
                },
                url: format!("https://example.com/{}", key),
                title: format!("story {}", key),
                body: "body".to_string(),
                labels: labels.iter().map(|s| s.to_string()).collect(),
                published_at: Some(Utc::now()),
                first_seen: Utc::now(),
            },
            task_id: Uuid::new_v4(),
            included,
            reason: String::new(),
            score,
            summary: format!("summary {}", key),
        }
    }

    #[test]
    fn inactive_and_unmatched_recipients_get_no_digest() {
        let mut inactive = Recipient::new("gone@example.com");
        inactive.active = false;
        let mut niche = Recipient::new("niche@example.com");
        niche.interests = vec!["gardening".to_string()];
        let all = Recipient::new("all@example.com");

        let task = task(vec![inactive, niche, all]);
        let items = vec![processed("a", &["tech"], 0.9, true)];

        let digests = assemble_digests(&task, &items, Utc::now());
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].recipient, "all@example.com");
    }

    #[test]
    fn excluded_articles_never_reach_a_digest() {
        let task = task(vec![Recipient::new("r@example.com")]);
        let items = vec![
            processed("kept", &["tech"], 0.5, true),
            processed("dropped", &["tech"], 0.9, false),
        ];
        let digests = assemble_digests(&task, &items, Utc::now());
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].item_keys.len(), 1);
        assert_eq!(digests[0].item_keys[0].dedup_key, "kept");
    }

    #[test]
    fn sorts_by_interest_priority_then_score() {
        let mut recipient = Recipient::new("r@example.com");
        recipient.interests = vec!["ai".to_string(), "tech".to_string()];
        let task = task(vec![recipient]);

        let items = vec![
            processed("tech-high", &["tech"], 0.9, true),
            processed("ai-low", &["ai"], 0.2, true),
            processed("ai-high", &["ai"], 0.8, true),
        ];
        let digests = assemble_digests(&task, &items, Utc::now());
        let keys: Vec<&str> = digests[0]
            .item_keys
            .iter()
            .map(|k| k.dedup_key.as_str())
            .collect();
        // "ai" outranks "tech" regardless of score; within "ai", score wins.
        assert_eq!(keys, vec!["ai-high", "ai-low", "tech-high"]);
    }

    #[test]
    fn truncates_to_configured_maximum() {
        let mut t = task(vec![Recipient::new("r@example.com")]);
        t.delivery.max_items_per_digest = 2;
        let items = vec![
            processed("a", &[], 0.9, true),
            processed("b", &[], 0.8, true),
            processed("c", &[], 0.7, true),
        ];
        let digests = assemble_digests(&t, &items, Utc::now());
        assert_eq!(digests[0].item_keys.len(), 2);
    }

    #[test]
    fn empty_digest_option_sends_a_notification() {
        let mut t = task(vec![Recipient::new("r@example.com")]);
        assert!(assemble_digests(&t, &[], Utc::now()).is_empty());

        t.delivery.send_empty_digests = true;
        let digests = assemble_digests(&t, &[], Utc::now());
        assert_eq!(digests.len(), 1);
        assert!(digests[0].body_text.contains("No new articles"));
    }

    #[test]
    fn digest_carries_unsubscribe_instructions() {
        let t = task(vec![Recipient::new("r@example.com")]);
        let items = vec![processed("a", &[], 0.9, true)];
        let digests = assemble_digests(&t, &items, Utc::now());
        assert!(digests[0]
            .body_text
            .contains(&format!("Unsubscribe: {}", t.id)));
    }
}
