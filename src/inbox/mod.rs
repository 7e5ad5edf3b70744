pub mod gmail;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use gmail::GmailInbox;

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("inbox API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
}

/// Identities returned by one listing call, in provider order (newest first).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageListing {
    pub ids: Vec<String>,
}

/// Header fields needed to classify a message. Missing headers are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub from: String,
    pub to: String,
    pub subject: String,
    /// Raw `Date` header.
    pub date: String,
    /// When the provider received the message.
    pub received_at: Option<DateTime<Utc>>,
}

/// The mailbox the triage cycle reads from.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// List every message matching `query` that arrived after `since`
    /// (epoch seconds), following pagination to the end.
    async fn list_new_messages(
        &self,
        since: Option<i64>,
        query: &str,
    ) -> Result<MessageListing, InboxError>;

    async fn fetch_metadata(&self, id: &str) -> Result<MessageMeta, InboxError>;

    async fn fetch_body(&self, id: &str) -> Result<String, InboxError>;
}
