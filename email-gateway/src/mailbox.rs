use std::net::TcpStream;

use async_trait::async_trait;
use interfaces::{CollaboratorError, Mailbox, UnsubscribeRequest};
use mail_parser::MessageParser;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImapSettings {
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
}

fn default_imap_port() -> u16 {
    993
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

type ImapSession = imap::Session<native_tls::TlsStream<TcpStream>>;

/// IMAP implementation of the mailbox collaborator.
///
/// Unsubscribe requests are unseen messages whose subject starts with
/// `Unsubscribe`, optionally followed by a task id
/// (`Unsubscribe: <task-id>`). Acknowledging a message flags it `\Seen`, so
/// the UNSEEN search never returns it again.
pub struct ImapMailbox {
    settings: ImapSettings,
}

impl ImapMailbox {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }

    fn open_session(settings: &ImapSettings) -> Result<ImapSession, CollaboratorError> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| CollaboratorError::Transient(format!("tls setup: {}", e)))?;

        let client = imap::connect(
            (settings.host.as_str(), settings.port),
            settings.host.as_str(),
            &tls,
        )
        .map_err(|e| CollaboratorError::Transient(format!("imap connect: {}", e)))?;

        let mut session = client
            .login(&settings.username, &settings.password)
            .map_err(|(e, _)| CollaboratorError::Rejection(format!("imap login: {}", e)))?;

        session
            .select(&settings.mailbox)
            .map_err(|e| CollaboratorError::Transient(format!("select mailbox: {}", e)))?;

        Ok(session)
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn poll_unsubscribes(&self) -> Result<Vec<UnsubscribeRequest>, CollaboratorError> {
        let settings = self.settings.clone();
        tokio::task::spawn_blocking(move || poll_blocking(&settings))
            .await
            .map_err(|e| CollaboratorError::Transient(format!("imap worker failed: {}", e)))?
    }

    async fn acknowledge(&self, handle: &str) -> Result<(), CollaboratorError> {
        let settings = self.settings.clone();
        let uid = handle.to_string();
        tokio::task::spawn_blocking(move || {
            let mut session = ImapMailbox::open_session(&settings)?;
            session
                .uid_store(&uid, "+FLAGS (\\Seen)")
                .map_err(|e| CollaboratorError::Transient(format!("mark seen: {}", e)))?;
            session.logout().ok();
            Ok(())
        })
        .await
        .map_err(|e| CollaboratorError::Transient(format!("imap worker failed: {}", e)))?
    }
}

fn poll_blocking(settings: &ImapSettings) -> Result<Vec<UnsubscribeRequest>, CollaboratorError> {
    let mut session = ImapMailbox::open_session(settings)?;

    let mut uids: Vec<u32> = session
        .uid_search("UNSEEN")
        .map_err(|e| CollaboratorError::Transient(format!("search: {}", e)))?
        .into_iter()
        .collect();
    uids.sort_unstable();

    let mut requests = Vec::new();
    for uid in uids {
        let messages = match session.uid_fetch(uid.to_string(), "RFC822") {
            Ok(messages) => messages,
            Err(e) => {
                warn!("fetch of message {} failed: {}", uid, e);
                continue;
            }
        };

        for message in messages.iter() {
            let Some(body) = message.body() else {
                continue;
            };
            let Some(parsed) = MessageParser::default().parse(body) else {
                warn!("unparseable message {}", uid);
                continue;
            };

            let subject = parsed.subject().unwrap_or("");
            let Some(task_id) = parse_unsubscribe_subject(subject) else {
                debug!("message {} is not an unsubscribe request", uid);
                continue;
            };

            let from = parsed
                .from()
                .and_then(|addrs| addrs.first())
                .and_then(|addr| addr.address.as_ref())
                .map(|addr| addr.to_string());
            let Some(from_address) = from else {
                warn!("unsubscribe message {} has no parseable sender", uid);
                continue;
            };

            requests.push(UnsubscribeRequest {
                from_address,
                task_id,
                handle: uid.to_string(),
            });
        }
    }

    session.logout().ok();
    Ok(requests)
}

/// `None`: not an unsubscribe subject. `Some(None)`: unsubscribe from all
/// tasks. `Some(Some(id))`: unsubscribe from one task.
fn parse_unsubscribe_subject(subject: &str) -> Option<Option<Uuid>> {
    let trimmed = subject.trim();
    let rest = strip_prefix_ignore_case(trimmed, "unsubscribe")?;
    let rest = rest.trim_start().strip_prefix(':').unwrap_or(rest).trim();
    Some(Uuid::parse_str(rest).ok())
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len()
        && s.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_unsubscribe_targets_all_tasks() {
        assert_eq!(parse_unsubscribe_subject("Unsubscribe"), Some(None));
        assert_eq!(parse_unsubscribe_subject("  unsubscribe  "), Some(None));
        assert_eq!(parse_unsubscribe_subject("UNSUBSCRIBE:"), Some(None));
    }

    #[test]
    fn unsubscribe_with_task_id_is_scoped() {
        let id = Uuid::new_v4();
        let parsed = parse_unsubscribe_subject(&format!("Unsubscribe: {}", id));
        assert_eq!(parsed, Some(Some(id)));
    }

    #[test]
    fn garbage_task_id_falls_back_to_all_tasks() {
        assert_eq!(
            parse_unsubscribe_subject("Unsubscribe: not-a-uuid"),
            Some(None)
        );
    }

    #[test]
    fn unrelated_subjects_are_ignored() {
        assert_eq!(parse_unsubscribe_subject("Re: your digest"), None);
        assert_eq!(parse_unsubscribe_subject(""), None);
        assert_eq!(parse_unsubscribe_subject("please unsubscribe me"), None);
    }
}
