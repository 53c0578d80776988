use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::time::{deserialize_id, deserialize_timestamp, deserialize_timestamp_opt};

pub const DEFAULT_SESSION_TITLE: &str = "New chat";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(alias = "createdAt", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(
        default,
        alias = "updatedAt",
        deserialize_with = "deserialize_timestamp_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(id: impl Into<String>, title: Option<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title,
            created_at,
            updated_at: None,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(DEFAULT_SESSION_TITLE)
    }

    /// Ordering key for most-recent-first listings.
    pub fn recency(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_backend_session_with_numeric_id() {
        let session: Session = serde_json::from_str(
            r#"{"id": 42, "title": null, "created_at": "2024-03-01T08:00:00.000001"}"#,
        )
        .unwrap();
        assert_eq!(session.id, "42");
        assert_eq!(session.display_title(), DEFAULT_SESSION_TITLE);
        assert!(session.updated_at.is_none());
    }

    #[test]
    fn accepts_camel_case_created_at() {
        let session: Session = serde_json::from_str(
            r#"{"id": "s1", "title": "Trip plan", "createdAt": "2024-03-01T08:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(session.display_title(), "Trip plan");
    }
}
