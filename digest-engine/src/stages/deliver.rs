use interfaces::{Digest, EmailTransport};
use tracing::{error, info};

use crate::retry::{with_retry, RetryPolicy};

/// Result of the delivery stage for one run.
#[derive(Debug, Default)]
pub struct DeliverOutcome {
    pub delivered: u64,
    /// (recipient, error) per failed delivery.
    pub failures: Vec<(String, String)>,
    pub attempted: usize,
}

impl DeliverOutcome {
    /// Mirrors the fetch stage: all recipients failing is a stage failure,
    /// anything less is partial at worst.
    pub fn all_deliveries_failed(&self) -> bool {
        self.attempted > 0 && self.delivered == 0
    }

    pub fn detail(&self) -> Vec<String> {
        self.failures
            .iter()
            .map(|(recipient, err)| format!("{}: {}", recipient, err))
            .collect()
    }
}

/// Send each digest through the email collaborator with a bounded retry
/// budget. A failed recipient never blocks delivery to the others.
pub async fn run_deliver(
    digests: &[Digest],
    transport: &dyn EmailTransport,
    policy: &RetryPolicy,
) -> DeliverOutcome {
    let mut outcome = DeliverOutcome {
        attempted: digests.len(),
        ..Default::default()
    };

    for digest in digests {
        let label = format!("send to {}", digest.recipient);
        match with_retry(policy, &label, || transport.send(digest)).await {
            Ok(()) => {
                info!("delivered digest to {}", digest.recipient);
                outcome.delivered += 1;
            }
            Err(e) => {
                error!("delivery to {} failed: {}", digest.recipient, e);
                outcome.failures.push((digest.recipient.clone(), e.to_string()));
            }
        }
    }

    outcome
}
