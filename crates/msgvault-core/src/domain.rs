//! Core data model: archived messages, media records, delivery units.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat id in the remote service (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Message id in the remote service, unique within its chat.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Monotonic key assigned at export time. Replay order follows this key, not
/// the remote id, so gaps in remote ids never disturb the sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderKey(pub u64);

impl OrderKey {
    pub fn next(self) -> OrderKey {
        OrderKey(self.0 + 1)
    }
}

/// Who sent the archived message. Everything except the numeric id may be
/// missing (the sender may have been deleted or hidden by the time we export).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub username: Option<String>,
}

impl Sender {
    /// Display string: "Name (@user)", "Name", "@user" or "Unknown User".
    pub fn display(&self) -> String {
        match (&self.name, &self.username) {
            (Some(name), Some(user)) => format!("{name} (@{user})"),
            (Some(name), None) => name.clone(),
            (None, Some(user)) => format!("@{user}"),
            (None, None) => "Unknown User".to_string(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Document,
    Audio,
    Voice,
    Sticker,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
    #[default]
    Pending,
    Complete,
    Failed,
}

/// An attachment of an archived message.
///
/// `remote_ref` is an opaque handle understood by the client adapter; it is
/// persisted so a resumed export can re-attempt the download. `local_path` is
/// owned exclusively by the export directory and is only set once the file
/// has been atomically renamed into place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub remote_ref: String,
    #[serde(default)]
    pub file_ext: Option<String>,
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub download_state: DownloadState,
}

impl MediaRef {
    pub fn pending(kind: MediaKind, remote_ref: impl Into<String>, file_ext: Option<String>) -> Self {
        Self {
            kind,
            remote_ref: remote_ref.into(),
            file_ext,
            local_path: None,
            content_hash: None,
            size_bytes: 0,
            download_state: DownloadState::Pending,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.download_state == DownloadState::Complete && self.local_path.is_some()
    }
}

/// Immutable snapshot of an archived message, as persisted in the manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub order_key: OrderKey,
    pub id: MessageId,
    pub chat_id: ChatId,
    #[serde(default)]
    pub sender: Sender,
    #[serde(default)]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    #[serde(default)]
    pub quote_text: Option<String>,
    #[serde(default)]
    pub media: Option<MediaRef>,
}

impl SourceMessage {
    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

/// One or more consecutive source messages merged into a single redelivered
/// message. `reply_target` stays `None` until the redelivery engine resolves
/// it against the destination id space.
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryUnit {
    pub members: Vec<SourceMessage>,
    pub reply_target: Option<MessageId>,
}

impl DeliveryUnit {
    pub fn solo(message: SourceMessage) -> Self {
        Self {
            members: vec![message],
            reply_target: None,
        }
    }

    pub fn member_ids(&self) -> Vec<MessageId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Source-space reply reference of the unit (always the first member's;
    /// later members may only reply within the unit itself).
    pub fn reply_to_id(&self) -> Option<MessageId> {
        self.members.first().and_then(|m| m.reply_to_id)
    }
}

/// Mapping from source message ids to the ids the destination assigned on
/// redelivery. Append-only: an id is mapped once and never remapped.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IdRemap {
    entries: BTreeMap<MessageId, MessageId>,
}

impl IdRemap {
    pub fn insert(&mut self, source: MessageId, destination: MessageId) {
        self.entries.entry(source).or_insert(destination);
    }

    pub fn get(&self, source: MessageId) -> Option<MessageId> {
        self.entries.get(&source).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
