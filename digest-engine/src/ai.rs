use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use interfaces::{AiBackend, AiConfig, AiVerdict, Article, CollaboratorError};
use tracing::{debug, info};

/// Named AI backends, selected by `AiConfig::backend`.
///
/// Provider selection is configuration-driven: a task names its backend and
/// the registry resolves it, no runtime type inspection anywhere.
pub struct AiRegistry {
    backends: HashMap<String, Arc<dyn AiBackend>>,
    default_backend: Option<String>,
}

impl AiRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_backend: None,
        }
    }

    pub fn register(&mut self, name: &str, backend: Arc<dyn AiBackend>) {
        info!("registering AI backend '{}' ({})", name, backend.backend_name());
        if self.default_backend.is_none() {
            self.default_backend = Some(name.to_string());
        }
        self.backends.insert(name.to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AiBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<Arc<dyn AiBackend>> {
        self.default_backend.as_deref().and_then(|n| self.get(n))
    }

    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }
}

impl Default for AiRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        registry.register("keyword", Arc::new(KeywordBackend::new()));
        registry
    }
}

/// Deterministic keyword/label scorer used when no AI provider is
/// configured. Scores articles by how well their labels and text match the
/// audience's interests and emits an extractive summary.
pub struct KeywordBackend {
    include_threshold: f64,
}

impl KeywordBackend {
    pub fn new() -> Self {
        Self {
            include_threshold: 0.2,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.include_threshold = threshold;
        self
    }

    fn score(&self, article: &Article, interests: &[String]) -> (f64, Vec<String>) {
        if interests.is_empty() {
            // No stated interests: everything is mildly relevant.
            return (0.5, Vec::new());
        }

        let text = format!("{} {}", article.title, article.body).to_lowercase();
        let mut score: f64 = 0.0;
        let mut matched = Vec::new();

        for interest in interests {
            let needle = interest.to_lowercase();
            if article.labels.iter().any(|l| l.eq_ignore_ascii_case(interest)) {
                score += 0.4;
                matched.push(interest.clone());
            } else if text.contains(&needle) {
                score += 0.25;
                matched.push(interest.clone());
            }
        }

        (score.min(1.0), matched)
    }

    fn summarize(&self, article: &Article) -> String {
        let body = article.body.trim();
        if body.is_empty() {
            return article.title.clone();
        }
        // First couple of sentences, capped.
        let mut summary: String = body.split_inclusive('.').take(2).collect();
        if summary.chars().count() > 280 {
            summary = summary.chars().take(277).collect::<String>() + "...";
        }
        format!("{}: {}", article.title, summary.trim())
    }
}

impl Default for KeywordBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AiBackend for KeywordBackend {
    fn backend_name(&self) -> String {
        "keyword (rule-based)".to_string()
    }

    async fn score_and_summarize(
        &self,
        batch: &[Article],
        _config: &AiConfig,
        interests: &[String],
    ) -> Result<Vec<AiVerdict>, CollaboratorError> {
        debug!("keyword backend scoring {} articles", batch.len());
        let verdicts = batch
            .iter()
            .map(|article| {
                let (score, matched) = self.score(article, interests);
                let included = score >= self.include_threshold;
                let reason = if matched.is_empty() {
                    "no interest match".to_string()
                } else {
                    format!("matched: {}", matched.join(", "))
                };
                AiVerdict {
                    key: article.key.clone(),
                    included,
                    score,
                    summary: self.summarize(article),
                    reason,
                }
            })
            .collect();
        Ok(verdicts)
    }
}
