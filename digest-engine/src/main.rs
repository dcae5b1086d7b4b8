use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use digest_engine::config::JsonConfigStore;
use digest_engine::sources::RssSource;
use digest_engine::{
    AiRegistry, ArticleStore, PipelineDeps, RetryPolicies, Scheduler, StatusTracker,
    UnsubscribeWatcher,
};
use email_gateway::{ImapMailbox, ImapSettings, SmtpMailer, SmtpSettings};
use interfaces::{CollaboratorError, ConfigStore, Digest, EmailTransport, FeedSource};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "newsbrief", about = "Scheduled RSS digest engine")]
struct Args {
    /// JSON task configuration file.
    #[arg(long, default_value = "data/config.json")]
    config: PathBuf,

    /// SQLite URL for the article store (falls back to $DATABASE_URL).
    #[arg(long)]
    database_url: Option<String>,

    /// Scheduler tick period, seconds.
    #[arg(long, default_value_t = 30)]
    tick_secs: u64,

    /// Unsubscribe mailbox poll period, seconds.
    #[arg(long, default_value_t = 300)]
    poll_secs: u64,

    /// Article retention horizon, days.
    #[arg(long, default_value_t = 14)]
    retention_days: i64,
}

/// Stand-in transport used when no SMTP settings are present: digests are
/// logged instead of sent.
struct LogTransport;

#[async_trait]
impl EmailTransport for LogTransport {
    async fn send(&self, digest: &Digest) -> Result<(), CollaboratorError> {
        info!(
            "dry-run delivery to {}: '{}'\n{}",
            digest.recipient, digest.subject, digest.body_text
        );
        Ok(())
    }
}

fn smtp_from_env() -> Option<SmtpSettings> {
    let host = std::env::var("SMTP_HOST").ok()?;
    let username = std::env::var("SMTP_USERNAME").unwrap_or_default();
    Some(SmtpSettings {
        host,
        port: std::env::var("SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587),
        from_address: std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone()),
        username,
        password: std::env::var("SMTP_PASSWORD").unwrap_or_default(),
    })
}

fn imap_from_env() -> Option<ImapSettings> {
    let host = std::env::var("IMAP_HOST").ok()?;
    Some(ImapSettings {
        host,
        port: std::env::var("IMAP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(993),
        username: std::env::var("IMAP_USERNAME").unwrap_or_default(),
        password: std::env::var("IMAP_PASSWORD").unwrap_or_default(),
        mailbox: std::env::var("IMAP_MAILBOX").unwrap_or_else(|_| "INBOX".to_string()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let database_url = args
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| "sqlite://data/newsbrief.db".to_string());

    if let Some(parent) = args.config.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if let Some(path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent)?;
        }
    }

    info!("opening article store at {}", database_url);
    let store = Arc::new(ArticleStore::open(&database_url).await?);

    let tracker = Arc::new(StatusTracker::new());
    match store.recent_runs(None, 100).await {
        Ok(runs) => tracker.preload(runs).await,
        Err(e) => warn!("could not preload run history: {}", e),
    }

    let mut sources: HashMap<String, Arc<dyn FeedSource>> = HashMap::new();
    let rss = Arc::new(RssSource::default());
    sources.insert(rss.kind().to_string(), rss);

    let transport: Arc<dyn EmailTransport> = match smtp_from_env() {
        Some(settings) => {
            info!("SMTP delivery via {}:{}", settings.host, settings.port);
            Arc::new(SmtpMailer::new(&settings)?)
        }
        None => {
            warn!("no SMTP_HOST configured, digests will be logged, not sent");
            Arc::new(LogTransport)
        }
    };

    let config = Arc::new(JsonConfigStore::open(&args.config).await?);

    let deps = PipelineDeps {
        sources,
        ai: Arc::new(AiRegistry::default()),
        transport,
        store: Arc::clone(&store),
        tracker: Arc::clone(&tracker),
        retry: RetryPolicies::default(),
    };
    let scheduler = Arc::new(Scheduler::with_config(
        deps,
        Arc::clone(&config) as Arc<dyn ConfigStore>,
    ));

    let tasks = config.tasks().await?;
    info!("loaded {} task(s) from {}", tasks.len(), args.config.display());
    for task in tasks {
        let name = task.name.clone();
        if let Err(e) = scheduler.register(task).await {
            error!("task '{}' not schedulable: {}", name, e);
        }
    }

    let loop_handle = scheduler.spawn_loop(Duration::from_secs(args.tick_secs));
    let maintenance = store.spawn_maintenance(Duration::from_secs(3600), args.retention_days);

    let (watcher_shutdown_tx, watcher_shutdown_rx) = tokio::sync::watch::channel(false);
    let watcher_handle = match imap_from_env() {
        Some(settings) => {
            info!("unsubscribe watcher polling {}:{}", settings.host, settings.port);
            let watcher = UnsubscribeWatcher::new(
                Arc::new(ImapMailbox::new(settings)),
                Arc::clone(&config) as Arc<dyn ConfigStore>,
                Arc::clone(&tracker),
                Duration::from_secs(args.poll_secs),
            );
            Some(watcher.spawn(watcher_shutdown_rx))
        }
        None => {
            warn!("no IMAP_HOST configured, unsubscribe watcher disabled");
            None
        }
    };

    info!("newsbrief running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    let _ = watcher_shutdown_tx.send(true);
    scheduler.shutdown(Duration::from_secs(30)).await;
    maintenance.abort();
    if let Some(handle) = watcher_handle {
        let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
    }
    let _ = loop_handle.await;

    Ok(())
}
