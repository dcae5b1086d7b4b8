//! Shared mock collaborators for the scenario tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use digest_engine::{
    AiRegistry, ArticleStore, PipelineDeps, RetryPolicies, RetryPolicy, StatusTracker,
};
use interfaces::{
    AiBackend, AiConfig, AiVerdict, Article, CadenceSpec, CollaboratorError, Digest,
    EmailTransport, FeedConfig, FeedSource, RawItem, Recipient, Task,
};
use uuid::Uuid;

/// Per-source scripted behavior.
#[derive(Clone)]
pub enum SourceBehavior {
    Items(Vec<RawItem>),
    /// Returns items after a delay (shorter than the call timeout).
    SlowItems(u64, Vec<RawItem>),
    Fail(String),
    /// Sleeps past the fetch call timeout.
    Hang,
}

pub struct ScriptedSource {
    behaviors: Mutex<HashMap<String, SourceBehavior>>,
    pub calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new(behaviors: &[(&str, SourceBehavior)]) -> Arc<Self> {
        Arc::new(Self {
            behaviors: Mutex::new(
                behaviors
                    .iter()
                    .map(|(id, b)| (id.to_string(), b.clone()))
                    .collect(),
            ),
            calls: AtomicU32::new(0),
        })
    }

    /// Rewrite a source's behavior mid-test.
    pub fn set(&self, source_id: &str, behavior: SourceBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(source_id.to_string(), behavior);
    }
}

#[async_trait]
impl FeedSource for ScriptedSource {
    fn kind(&self) -> &'static str {
        "rss"
    }

    async fn fetch(
        &self,
        config: &FeedConfig,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&config.source_id)
            .cloned();
        match behavior {
            Some(SourceBehavior::Items(items)) => Ok(items),
            Some(SourceBehavior::SlowItems(millis, items)) => {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(items)
            }
            Some(SourceBehavior::Fail(msg)) => Err(CollaboratorError::Transient(msg)),
            Some(SourceBehavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(Vec::new())
            }
            None => Err(CollaboratorError::Rejection(format!(
                "unscripted source {}",
                config.source_id
            ))),
        }
    }
}

/// AI backend with a switchable mode.
pub enum AiMode {
    IncludeAll,
    FailAll,
}

pub struct ScriptedAi {
    pub mode: AiMode,
    pub calls: AtomicU32,
}

impl ScriptedAi {
    pub fn new(mode: AiMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl AiBackend for ScriptedAi {
    fn backend_name(&self) -> String {
        "scripted".to_string()
    }

    async fn score_and_summarize(
        &self,
        batch: &[Article],
        _config: &AiConfig,
        _interests: &[String],
    ) -> Result<Vec<AiVerdict>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            AiMode::IncludeAll => Ok(batch
                .iter()
                .map(|a| AiVerdict {
                    key: a.key.clone(),
                    included: true,
                    score: 0.9,
                    summary: format!("summary of {}", a.title),
                    reason: "scripted include".to_string(),
                })
                .collect()),
            AiMode::FailAll => Err(CollaboratorError::Transient("provider down".to_string())),
        }
    }
}

/// Email transport that records deliveries.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<Digest>>,
}

#[async_trait]
impl EmailTransport for RecordingTransport {
    async fn send(&self, digest: &Digest) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(digest.clone());
        Ok(())
    }
}

pub fn fast_retry() -> RetryPolicies {
    let policy = RetryPolicy {
        max_attempts: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        call_timeout: Duration::from_millis(100),
    };
    RetryPolicies {
        fetch: policy.clone(),
        ai: policy.clone(),
        send: policy,
    }
}

pub async fn deps_with(
    source: Arc<ScriptedSource>,
    ai: Arc<ScriptedAi>,
    transport: Arc<RecordingTransport>,
) -> PipelineDeps {
    let mut sources: HashMap<String, Arc<dyn FeedSource>> = HashMap::new();
    sources.insert("rss".to_string(), source);

    let mut registry = AiRegistry::new();
    registry.register("scripted", ai);

    PipelineDeps {
        sources,
        ai: Arc::new(registry),
        transport,
        store: Arc::new(ArticleStore::in_memory().await.unwrap()),
        tracker: Arc::new(StatusTracker::new()),
        retry: fast_retry(),
    }
}

pub fn raw_item(slug: &str) -> RawItem {
    RawItem {
        guid: Some(format!("guid-{}", slug)),
        url: format!("https://example.com/{}", slug),
        title: format!("story {}", slug),
        body: format!("body of {}", slug),
        published_at: Some(Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap()),
    }
}

pub fn feed(source_id: &str, labels: &[&str]) -> FeedConfig {
    FeedConfig {
        source_id: source_id.to_string(),
        kind: "rss".to_string(),
        url: format!("https://example.com/{}/feed.xml", source_id),
        labels: labels.iter().map(|s| s.to_string()).collect(),
        max_items: 25,
    }
}

pub fn task(feeds: Vec<FeedConfig>, recipients: Vec<Recipient>) -> Task {
    Task {
        id: Uuid::new_v4(),
        name: "scenario".to_string(),
        enabled: true,
        feeds,
        recipients,
        tag_rules: Default::default(),
        ai: AiConfig {
            backend: "scripted".to_string(),
            batch_size: 8,
            min_score: 0.0,
            cache_summaries: false,
        },
        cadence: CadenceSpec::Interval { minutes: 60 },
        delivery: Default::default(),
    }
}
