use std::sync::Arc;
use std::time::Duration;

use interfaces::{ConfigStore, Mailbox};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::tracker::StatusTracker;

/// Background poller that turns mailbox unsubscribe requests into recipient
/// deactivations.
///
/// Runs on its own cadence, independent of task runs. Poll failures are
/// logged and retried on the next cycle; nothing here is fatal to the loop.
pub struct UnsubscribeWatcher {
    mailbox: Arc<dyn Mailbox>,
    config: Arc<dyn ConfigStore>,
    tracker: Arc<StatusTracker>,
    poll_interval: Duration,
    call_timeout: Duration,
}

impl UnsubscribeWatcher {
    pub fn new(
        mailbox: Arc<dyn Mailbox>,
        config: Arc<dyn ConfigStore>,
        tracker: Arc<StatusTracker>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            mailbox,
            config,
            tracker,
            poll_interval,
            call_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// One poll cycle: fetch pending requests, deactivate matching
    /// recipients, acknowledge each handled message exactly once.
    /// Returns the number of requests processed.
    pub async fn poll_once(&self) -> usize {
        let requests = match tokio::time::timeout(self.call_timeout, self.mailbox.poll_unsubscribes())
            .await
        {
            Ok(Ok(requests)) => requests,
            Ok(Err(e)) => {
                warn!("unsubscribe poll failed: {}", e);
                return 0;
            }
            Err(_) => {
                warn!("unsubscribe poll timed out after {:?}", self.call_timeout);
                return 0;
            }
        };

        if requests.is_empty() {
            debug!("no pending unsubscribe requests");
            return 0;
        }
        info!("processing {} unsubscribe request(s)", requests.len());

        let mut processed = 0;
        for request in requests {
            match self
                .config
                .deactivate_recipient(request.task_id, &request.from_address)
                .await
            {
                Ok(true) => {
                    self.tracker
                        .record_unsubscribe(&request.from_address, request.task_id)
                        .await;
                }
                Ok(false) => {
                    // Unknown sender; still acknowledged below so the
                    // message is not re-examined every cycle.
                    info!(
                        "unsubscribe from {} matched no active recipient",
                        request.from_address
                    );
                }
                Err(e) => {
                    // Leave unacknowledged: the next cycle retries, and
                    // deactivation is idempotent.
                    warn!(
                        "failed to deactivate {}: {}, will retry next poll",
                        request.from_address, e
                    );
                    continue;
                }
            }

            match self.mailbox.acknowledge(&request.handle).await {
                Ok(()) => processed += 1,
                Err(e) => warn!(
                    "failed to acknowledge unsubscribe message {}: {}",
                    request.handle, e
                ),
            }
        }
        processed
    }

    /// Run the poll loop until shutdown is signalled.
    pub fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.poll_once().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("unsubscribe watcher stopped");
        })
    }
}
