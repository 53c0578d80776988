use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::{deserialize_id, deserialize_timestamp_opt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    #[serde(alias = "ai", alias = "bot")]
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transcript entry.
///
/// Locally created entries carry a `local_id` until the backend assigns an
/// `id`; entries loaded from history only carry `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

impl Message {
    pub fn user_pending(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: None,
            local_id: Some(new_local_id()),
            session_id: session_id.into(),
            role: MessageRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
        }
    }

    pub fn assistant_streaming(session_id: impl Into<String>) -> Self {
        Self {
            id: None,
            local_id: Some(new_local_id()),
            session_id: session_id.into(),
            role: MessageRole::Assistant,
            content: String::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Streaming,
        }
    }

    /// Stable handle for rendering: the server id when known, else the local id.
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().or(self.local_id.as_deref())
    }

    /// True when both entries denote the same logical message.
    pub fn same_identity(&self, other: &Message) -> bool {
        let same_id = matches!((&self.id, &other.id), (Some(a), Some(b)) if a == b);
        let same_local = matches!((&self.local_id, &other.local_id), (Some(a), Some(b)) if a == b);
        same_id || same_local
    }

    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }
}

pub fn new_local_id() -> String {
    format!("loc_{}", uuid::Uuid::new_v4().simple())
}

/// A message as returned by the history endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(
        default,
        alias = "created_at",
        alias = "createdAt",
        deserialize_with = "deserialize_timestamp_opt"
    )]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, alias = "isComplete", skip_serializing_if = "Option::is_none")]
    pub is_complete: Option<bool>,
}

impl HistoryEntry {
    /// True when this entry is an assistant turn the server has finished.
    pub fn is_finished_assistant(&self) -> bool {
        self.role == MessageRole::Assistant && self.is_complete != Some(false)
    }

    /// Convert into a cache entry.
    ///
    /// An unfinished assistant entry maps to `Streaming` only when it is the
    /// last entry of the snapshot; earlier unfinished entries were abandoned
    /// server-side and map to `Failed`.
    pub fn into_message(self, session_id: &str, is_last: bool) -> Message {
        let status = match (self.role, self.is_complete) {
            (MessageRole::Assistant, Some(false)) if is_last => MessageStatus::Streaming,
            (MessageRole::Assistant, Some(false)) => MessageStatus::Failed,
            _ => MessageStatus::Complete,
        };
        Message {
            id: Some(self.id),
            local_id: None,
            session_id: session_id.to_string(),
            role: self.role,
            content: self.content,
            timestamp: self.timestamp.unwrap_or(MISSING_TIMESTAMP),
            status,
        }
    }
}

/// Stands in for a timestamp the server left out, so converting the same
/// snapshot twice gives the same messages.
pub const MISSING_TIMESTAMP: DateTime<Utc> = DateTime::<Utc>::UNIX_EPOCH;

pub fn history_to_messages(session_id: &str, entries: Vec<HistoryEntry>) -> Vec<Message> {
    let last = entries.len().saturating_sub(1);
    entries
        .into_iter()
        .enumerate()
        .map(|(idx, entry)| entry.into_message(session_id, idx == last))
        .collect()
}
