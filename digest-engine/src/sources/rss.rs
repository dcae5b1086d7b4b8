use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use interfaces::{CollaboratorError, FeedConfig, FeedSource, RawItem};
use reqwest::Client;
use tracing::{debug, info};
use url::Url;

/// Plain RSS/Atom feed source built on reqwest + feed-rs.
pub struct RssSource {
    client: Client,
}

impl RssSource {
    pub fn new(user_agent: &str, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(request_timeout)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }

    fn classify(status: reqwest::StatusCode) -> CollaboratorError {
        // Auth and client errors will not heal on retry.
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
            || status == reqwest::StatusCode::NOT_FOUND
            || status == reqwest::StatusCode::GONE
        {
            CollaboratorError::Rejection(format!("HTTP {}", status))
        } else {
            CollaboratorError::Transient(format!("HTTP {}", status))
        }
    }
}

impl Default for RssSource {
    fn default() -> Self {
        Self::new("NewsBrief/0.1", Duration::from_secs(30))
    }
}

#[async_trait]
impl FeedSource for RssSource {
    fn kind(&self) -> &'static str {
        "rss"
    }

    async fn fetch(
        &self,
        config: &FeedConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawItem>, CollaboratorError> {
        let url = Url::parse(&config.url)
            .map_err(|e| CollaboratorError::Rejection(format!("invalid feed url: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CollaboratorError::Rejection(format!(
                "unsupported feed url scheme '{}'",
                url.scheme()
            )));
        }

        debug!("fetching feed {} ({})", config.source_id, config.url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CollaboratorError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify(status));
        }

        let content = response
            .bytes()
            .await
            .map_err(|e| CollaboratorError::Transient(format!("read body: {}", e)))?;

        let feed = feed_rs::parser::parse(content.as_ref())
            .map_err(|e| CollaboratorError::Rejection(format!("unparseable feed: {}", e)))?;

        let mut items = Vec::new();
        for entry in feed.entries {
            let Some(link) = entry.links.first().map(|l| l.href.clone()) else {
                continue;
            };
            let title = entry
                .title
                .map(|t| t.content)
                .unwrap_or_else(|| "Untitled".to_string());
            let body = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();
            let published_at = entry.published.or(entry.updated);

            if let (Some(since), Some(published)) = (since, published_at) {
                if published <= since {
                    continue;
                }
            }

            items.push(RawItem {
                guid: (!entry.id.is_empty()).then(|| entry.id.clone()),
                url: link,
                title,
                body,
                published_at,
            });
            if items.len() >= config.max_items {
                break;
            }
        }

        info!(
            "feed {} returned {} items",
            config.source_id,
            items.len()
        );
        Ok(items)
    }
}
