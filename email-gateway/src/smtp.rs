use async_trait::async_trait;
use interfaces::{CollaboratorError, Digest, EmailTransport};
use lettre::message::{Mailbox as Address, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

fn default_smtp_port() -> u16 {
    587
}

/// SMTP implementation of the email collaborator, built on lettre.
///
/// lettre's SMTP transport is blocking, so each send runs on the blocking
/// thread pool; the caller's per-call timeout still bounds it.
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: Address,
}

impl SmtpMailer {
    pub fn new(settings: &SmtpSettings) -> Result<Self, CollaboratorError> {
        let from: Address = settings
            .from_address
            .parse()
            .map_err(|e| CollaboratorError::Rejection(format!("invalid from address: {}", e)))?;

        let transport = SmtpTransport::starttls_relay(&settings.host)
            .map_err(|e| CollaboratorError::Rejection(format!("smtp relay setup: {}", e)))?
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .build();

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl EmailTransport for SmtpMailer {
    async fn send(&self, digest: &Digest) -> Result<(), CollaboratorError> {
        let to: Address = digest
            .recipient
            .parse()
            .map_err(|e| CollaboratorError::Rejection(format!("invalid recipient address: {}", e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(digest.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                digest.body_text.clone(),
                digest.body_html.clone(),
            ))
            .map_err(|e| CollaboratorError::Rejection(format!("message build: {}", e)))?;

        debug!("sending digest '{}' to {}", digest.subject, digest.recipient);

        let transport = self.transport.clone();
        let result = tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| CollaboratorError::Transient(format!("smtp worker failed: {}", e)))?;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(CollaboratorError::Rejection(e.to_string())),
            Err(e) => Err(CollaboratorError::Transient(e.to_string())),
        }
    }
}
