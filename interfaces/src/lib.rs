pub mod collaborators;
pub mod defs;
pub mod error;

pub use collaborators::{AiBackend, ConfigStore, EmailTransport, FeedSource, Mailbox};
pub use defs::*;
pub use error::CollaboratorError;
