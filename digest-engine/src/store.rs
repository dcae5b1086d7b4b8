use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use interfaces::{Article, ArticleKey};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::types::{EngineError, Result, TaskRun};

/// Durable article cache backed by SQLite.
///
/// Holds three things: the dedup ledger of every article ever seen, the
/// optional summary cache, and the terminal run history. Every write is a
/// single autocommitted statement, so a crash between two inserts leaves the
/// ledger consistent.
pub struct ArticleStore {
    pool: SqlitePool,
}

/// A summary persisted by an earlier run, reusable when the task's AI config
/// has `cache_summaries` set.
#[derive(Debug, Clone)]
pub struct CachedSummary {
    pub included: bool,
    pub score: f64,
    pub summary: String,
    pub reason: String,
}

impl ArticleStore {
    /// Open (and create if missing) a store at the given SQLite URL,
    /// e.g. `sqlite://data/newsbrief.db`.
    pub async fn open(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(EngineError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store, used by tests. Single connection: each SQLite
    /// `:memory:` connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                source_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                body TEXT NOT NULL,
                labels TEXT NOT NULL,
                published_at TEXT,
                first_seen TEXT NOT NULL,
                PRIMARY KEY (source_id, dedup_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS summaries (
                source_id TEXT NOT NULL,
                dedup_key TEXT NOT NULL,
                included INTEGER NOT NULL,
                score REAL NOT NULL,
                summary TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (source_id, dedup_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_runs (
                run_id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                started_at TEXT NOT NULL,
                outcome TEXT NOT NULL,
                record TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append an article if its (source id, dedup key) pair is unseen.
    /// Returns true when the article is new. The insert is immediate, not
    /// buffered: a crash mid-run neither re-processes nor loses it.
    pub async fn insert_if_new(&self, article: &Article) -> Result<bool> {
        let labels = serde_json::to_string(&article.labels)?;
        let result = sqlx::query(
            r#"
            INSERT INTO articles (source_id, dedup_key, url, title, body, labels, published_at, first_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT (source_id, dedup_key) DO NOTHING
            "#,
        )
        .bind(&article.key.source_id)
        .bind(&article.key.dedup_key)
        .bind(&article.url)
        .bind(&article.title)
        .bind(&article.body)
        .bind(labels)
        .bind(article.published_at.map(|t| t.to_rfc3339()))
        .bind(article.first_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn is_seen(&self, key: &ArticleKey) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM articles WHERE source_id = ?1 AND dedup_key = ?2")
            .bind(&key.source_id)
            .bind(&key.dedup_key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn article_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Remove articles, cached summaries and run records past the retention
    /// horizon. Returns the number of articles removed.
    pub async fn prune(&self, older_than: Duration) -> Result<u64> {
        let cutoff = (Utc::now() - older_than).to_rfc3339();

        let deleted = sqlx::query("DELETE FROM articles WHERE first_seen < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM summaries WHERE created_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM task_runs WHERE started_at < ?1")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;

        if deleted > 0 {
            info!("Retention sweep removed {} articles", deleted);
        }
        Ok(deleted)
    }

    pub async fn cache_summary(
        &self,
        key: &ArticleKey,
        included: bool,
        score: f64,
        summary: &str,
        reason: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO summaries (source_id, dedup_key, included, score, summary, reason, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (source_id, dedup_key) DO UPDATE SET
                included = excluded.included,
                score = excluded.score,
                summary = excluded.summary,
                reason = excluded.reason,
                created_at = excluded.created_at
            "#,
        )
        .bind(&key.source_id)
        .bind(&key.dedup_key)
        .bind(included as i64)
        .bind(score)
        .bind(summary)
        .bind(reason)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cached_summary(&self, key: &ArticleKey) -> Result<Option<CachedSummary>> {
        let row = sqlx::query(
            "SELECT included, score, summary, reason FROM summaries WHERE source_id = ?1 AND dedup_key = ?2",
        )
        .bind(&key.source_id)
        .bind(&key.dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CachedSummary {
            included: row.get::<i64, _>("included") != 0,
            score: row.get("score"),
            summary: row.get("summary"),
            reason: row.get("reason"),
        }))
    }

    /// Append a terminal run record as JSON.
    pub async fn record_run(&self, run: &TaskRun) -> Result<()> {
        let record = serde_json::to_string(run)?;
        sqlx::query(
            r#"
            INSERT INTO task_runs (run_id, task_id, started_at, outcome, record)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (run_id) DO UPDATE SET outcome = excluded.outcome, record = excluded.record
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.task_id.to_string())
        .bind(run.started_at.to_rfc3339())
        .bind(run.outcome.to_string())
        .bind(record)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs, newest first, optionally restricted to one task.
    pub async fn recent_runs(&self, task_id: Option<Uuid>, limit: u32) -> Result<Vec<TaskRun>> {
        let rows = if let Some(task_id) = task_id {
            sqlx::query(
                "SELECT record FROM task_runs WHERE task_id = ?1 ORDER BY started_at DESC LIMIT ?2",
            )
            .bind(task_id.to_string())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query("SELECT record FROM task_runs ORDER BY started_at DESC LIMIT ?1")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
        };

        let mut runs = Vec::with_capacity(rows.len());
        for row in rows {
            let record: String = row.get("record");
            let run: TaskRun = serde_json::from_str(&record).map_err(|e| {
                EngineError::Integrity(format!("unreadable run record in store: {}", e))
            })?;
            runs.push(run);
        }
        Ok(runs)
    }

    /// Periodic retention sweep, owned by the store.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        every: std::time::Duration,
        retention_days: i64,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                match store.prune(Duration::days(retention_days)).await {
                    Ok(n) => debug!("maintenance sweep done, {} articles pruned", n),
                    Err(e) => warn!("maintenance sweep failed: {}", e),
                }
            }
        })
    }
}
