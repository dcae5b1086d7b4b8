use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::defs::{AiConfig, AiVerdict, Article, Digest, FeedConfig, RawItem, Task, UnsubscribeRequest};
use crate::error::CollaboratorError;

/// A feed collaborator: pulls raw items for one feed configuration.
///
/// Implementations handle one `FeedConfig::kind` each ("rss", a site-specific
/// scraper, ...). Items already published before `since` may be omitted; the
/// engine deduplicates regardless, so over-returning is harmless.
#[async_trait]
pub trait FeedSource: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn fetch(
        &self,
        config: &FeedConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>, CollaboratorError>;
}

/// An AI collaborator: scores a batch of articles against the recipient
/// audience's interests and produces a summary per article.
///
/// One verdict per input article, matched back by `ArticleKey`. Providers are
/// selected by configuration (`AiConfig::backend`), never by runtime type
/// inspection.
#[async_trait]
pub trait AiBackend: Send + Sync {
    fn backend_name(&self) -> String;

    async fn score_and_summarize(
        &self,
        batch: &[Article],
        config: &AiConfig,
        interests: &[String],
    ) -> Result<Vec<AiVerdict>, CollaboratorError>;
}

/// The email collaborator: sends one rendered digest.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, digest: &Digest) -> Result<(), CollaboratorError>;
}

/// The mailbox collaborator polled by the unsubscribe watcher.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Return pending unsubscribe requests. Requests stay pending until
    /// acknowledged, so callers must tolerate seeing one twice.
    async fn poll_unsubscribes(&self) -> Result<Vec<UnsubscribeRequest>, CollaboratorError>;

    /// Mark the source message handled so it is not returned again.
    async fn acknowledge(&self, handle: &str) -> Result<(), CollaboratorError>;
}

/// The configuration collaborator. The engine reads task snapshots from it;
/// the unsubscribe watcher writes recipient deactivations through it.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn tasks(&self) -> Result<Vec<Task>, CollaboratorError>;

    /// Set the matching recipient's active flag false. `task_id` of `None`
    /// means every task. Returns true if any recipient changed state.
    async fn deactivate_recipient(
        &self,
        task_id: Option<Uuid>,
        address: &str,
    ) -> Result<bool, CollaboratorError>;
}
