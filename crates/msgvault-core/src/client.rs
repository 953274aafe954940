//! Port for the remote chat service.
//!
//! The transport/auth layer lives in an adapter crate; the core only sees an
//! already-authenticated handle. Rate limits surface as
//! [`Error::RateLimited`](crate::Error::RateLimited), permanent refusals as
//! [`Error::Rejected`](crate::Error::Rejected).

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, MediaRef, MessageId},
    Result,
};

/// Opaque pagination cursor handed back by the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageCursor(pub String);

/// Raw message record as listed from the remote service, before the export
/// coordinator assigns an order key.
#[derive(Clone, Debug, Default)]
pub struct RemoteMessage {
    pub id: MessageId,
    pub sender_id: Option<i64>,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub text: Option<String>,
    pub reply_to_id: Option<MessageId>,
    pub quote_text: Option<String>,
    pub media: Option<MediaRef>,
}

#[derive(Clone, Debug, Default)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
    pub next: Option<PageCursor>,
}

/// Content for one destination send. Exactly one destination message results
/// from each send, which is what makes unit retries safe to repeat.
#[derive(Clone, Debug, Default)]
pub struct OutgoingMessage {
    /// HTML body, or the caption when `media_path` is set.
    pub html: Option<String>,
    pub media_path: Option<PathBuf>,
    pub reply_to: Option<MessageId>,
    pub silent: bool,
}

/// Remote chat service handle.
///
/// Contract notes:
/// - `list_messages` yields pages in chronological order (oldest first); the
///   adapter owns any reversal/buffering of the underlying iteration.
/// - `download_media` and `send_message` are idempotent from the caller's
///   point of view: repeating them after a FloodWait is safe.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn list_messages(
        &self,
        chat: ChatId,
        cursor: Option<PageCursor>,
        limit: usize,
    ) -> Result<MessagePage>;

    async fn download_media(
        &self,
        chat: ChatId,
        message: MessageId,
        media: &MediaRef,
    ) -> Result<Vec<u8>>;

    async fn send_message(&self, chat: ChatId, outgoing: OutgoingMessage) -> Result<MessageId>;
}
