use std::time::Duration;

/// Failure taxonomy for calls into external collaborators (feeds, AI
/// providers, SMTP/IMAP servers, config storage).
///
/// `Transient` and `Timeout` are retried with bounded backoff; `Rejection`
/// (quota, bad credentials, permanent server refusal) is surfaced immediately
/// and never retried within the same run.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected by collaborator: {0}")]
    Rejection(String),
}

impl CollaboratorError {
    /// A timeout is treated identically to a transient failure for
    /// retry/backoff purposes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CollaboratorError::Rejection(_))
    }
}
