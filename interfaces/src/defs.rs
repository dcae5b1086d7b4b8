use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A configured recurring digest job: which feeds to read, who receives the
/// result, how the AI backend is driven, and on what cadence it runs.
///
/// Tasks are owned by the configuration collaborator. The engine treats them
/// as read-only and snapshots the definition when a run starts, so edits only
/// take effect between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub feeds: Vec<FeedConfig>,
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub tag_rules: TagRules,
    #[serde(default)]
    pub ai: AiConfig,
    pub cadence: CadenceSpec,
    #[serde(default)]
    pub delivery: DeliveryOptions,
}

impl Task {
    /// Recipients the pipeline may deliver to.
    pub fn active_recipients(&self) -> impl Iterator<Item = &Recipient> {
        self.recipients.iter().filter(|r| r.active)
    }
}

/// One feed entry inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Stable identifier, unique within the task. Part of every article's
    /// dedup identity.
    pub source_id: String,
    /// Which `FeedSource` implementation handles this entry.
    #[serde(default = "default_kind")]
    pub kind: String,
    pub url: String,
    /// Labels this source stamps onto its articles; matched against
    /// task tag rules and recipient interests.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_feed_items")]
    pub max_items: usize,
}

/// Include/exclude tag rules evaluated before any AI call.
///
/// Exclusion is authoritative: an article carrying an excluded label never
/// reaches the AI backend or a digest. An empty include list admits all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagRules {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// A digest recipient. `interests` is ordered: earlier entries have higher
/// priority when sorting a digest. Empty interests match every label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default)]
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl Recipient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            active: true,
            interests: Vec::new(),
            unsubscribed_at: None,
        }
    }
}

/// Settings forwarded to the AI backend, plus engine-side batching knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Registry key of the backend to use.
    pub backend: String,
    /// Articles per `score_and_summarize` call.
    pub batch_size: usize,
    /// Articles the backend includes but scores below this are still dropped.
    pub min_score: f64,
    /// Reuse summaries persisted by earlier runs for the same article.
    pub cache_summaries: bool,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            backend: "keyword".to_string(),
            batch_size: 8,
            min_score: 0.0,
            cache_summaries: false,
        }
    }
}

/// Declarative run cadence, as written in configuration. Compiled and
/// validated by the engine before scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CadenceSpec {
    /// Run every `minutes`, measured from the previous run's start.
    Interval { minutes: u64 },
    /// Cron expression (seconds field included, e.g. `"0 0 8 * * *"`).
    Cron { expr: String },
}

/// Digest shaping options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryOptions {
    pub max_items_per_digest: usize,
    /// Send a "nothing matched today" mail instead of staying silent.
    pub send_empty_digests: bool,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            max_items_per_digest: 20,
            send_empty_digests: false,
        }
    }
}

/// Dedup identity of an article: unique per (source, dedup key) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArticleKey {
    pub source_id: String,
    pub dedup_key: String,
}

impl std::fmt::Display for ArticleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.source_id, self.dedup_key)
    }
}

/// A raw item as returned by a feed collaborator, before normalization.
#[derive(Debug, Clone)]
pub struct RawItem {
    pub guid: Option<String>,
    pub url: String,
    pub title: String,
    pub body: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// A fetched, normalized article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub key: ArticleKey,
    pub url: String,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
}

/// An article plus the AI-derived attributes attached by the
/// filter/summarize stage. Lives only for the duration of a run.
#[derive(Debug, Clone)]
pub struct ProcessedArticle {
    pub article: Article,
    pub task_id: Uuid,
    pub included: bool,
    pub reason: String,
    pub score: f64,
    pub summary: String,
}

/// One backend verdict for one article in a batch.
#[derive(Debug, Clone)]
pub struct AiVerdict {
    pub key: ArticleKey,
    pub included: bool,
    pub score: f64,
    pub summary: String,
    pub reason: String,
}

/// A rendered per-recipient digest, ready for the email collaborator.
#[derive(Debug, Clone)]
pub struct Digest {
    pub task_id: Uuid,
    pub task_name: String,
    pub recipient: String,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub item_keys: Vec<ArticleKey>,
}

/// An unsubscribe request extracted from the mailbox.
///
/// `task_id` is present when the message subject carried one
/// (`Unsubscribe: <task-id>`); absent means "all tasks".
#[derive(Debug, Clone)]
pub struct UnsubscribeRequest {
    pub from_address: String,
    pub task_id: Option<Uuid>,
    /// Opaque handle passed back to `Mailbox::acknowledge`.
    pub handle: String,
}

fn default_true() -> bool {
    true
}

fn default_kind() -> String {
    "rss".to_string()
}

fn default_feed_items() -> usize {
    25
}
