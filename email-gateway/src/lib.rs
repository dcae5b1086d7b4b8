pub mod mailbox;
pub mod smtp;

pub use mailbox::{ImapMailbox, ImapSettings};
pub use smtp::{SmtpMailer, SmtpSettings};
