//! Transport payloads exchanged over the live session channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MessageRole;
use crate::time::{deserialize_id_opt, deserialize_timestamp_opt};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed event payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("`{kind}` event is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

/// Server acknowledgement of a user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAck {
    pub id: Option<String>,
    pub local_id: Option<String>,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Token {
        content: String,
    },
    Title {
        content: String,
        session_id: Option<String>,
    },
    Error {
        content: String,
    },
    End {
        timestamp: Option<DateTime<Utc>>,
    },
    Ack(MessageAck),
    /// The backend asks for a file before it can answer.
    NeedFile {
        content: String,
    },
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token { .. } => "token",
            Self::Title { .. } => "title",
            Self::Error { .. } => "error",
            Self::End { .. } => "end",
            Self::Ack(_) => "message",
            Self::NeedFile { .. } => "need_file",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }

    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let raw: RawInbound = serde_json::from_str(payload)?;
        raw.into_event()
    }
}

#[derive(Debug, Deserialize)]
struct RawInbound {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp_opt")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "chat_id",
        alias = "sessionId",
        deserialize_with = "deserialize_id_opt"
    )]
    session_id: Option<String>,
    #[serde(default, deserialize_with = "deserialize_id_opt")]
    id: Option<String>,
    #[serde(default, alias = "localId")]
    local_id: Option<String>,
    #[serde(default)]
    role: Option<MessageRole>,
}

impl RawInbound {
    fn into_event(self) -> Result<InboundEvent, ProtocolError> {
        let Some(kind) = self.kind.as_deref() else {
            // Bare `{"error": "..."}` objects predate the typed protocol.
            if let Some(error) = self.error {
                return Ok(InboundEvent::Error { content: error });
            }
            return Err(ProtocolError::MissingField {
                kind: "event",
                field: "type",
            });
        };

        match kind {
            "token" => Ok(InboundEvent::Token {
                content: self.content.ok_or(ProtocolError::MissingField {
                    kind: "token",
                    field: "content",
                })?,
            }),
            "title" | "title_update" => Ok(InboundEvent::Title {
                content: self.content.or(self.title).ok_or(ProtocolError::MissingField {
                    kind: "title",
                    field: "content",
                })?,
                session_id: self.session_id,
            }),
            "error" => Ok(InboundEvent::Error {
                content: self
                    .content
                    .or(self.error)
                    .unwrap_or_else(|| "stream failed".to_string()),
            }),
            "end" | "done" => Ok(InboundEvent::End {
                timestamp: self.timestamp,
            }),
            "message" => Ok(InboundEvent::Ack(MessageAck {
                id: self.id,
                local_id: self.local_id,
                role: self.role.unwrap_or(MessageRole::User),
                content: self
                    .content
                    .or(self.message)
                    .ok_or(ProtocolError::MissingField {
                        kind: "message",
                        field: "content",
                    })?,
                timestamp: self.timestamp,
            })),
            "need_file" => Ok(InboundEvent::NeedFile {
                content: self.content.unwrap_or_default(),
            }),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }
}

/// A user turn sent on an open, session-scoped channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPayload {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
}

impl OutboundPayload {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            local_id: None,
        }
    }

    pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
        self.local_id = Some(local_id.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::json!(self).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_event_types() {
        assert_eq!(
            InboundEvent::parse(r#"{"type":"token","content":"Hi"}"#).unwrap(),
            InboundEvent::Token {
                content: "Hi".into()
            }
        );
        assert_eq!(
            InboundEvent::parse(r#"{"type":"end","content":""}"#).unwrap(),
            InboundEvent::End { timestamp: None }
        );
        assert!(matches!(
            InboundEvent::parse(r#"{"type":"error","content":"boom"}"#).unwrap(),
            InboundEvent::Error { content } if content == "boom"
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"type":"title","content":"Weather"}"#).unwrap(),
            InboundEvent::Title { content, session_id: None } if content == "Weather"
        ));
    }

    #[test]
    fn accepts_legacy_shapes() {
        let done = InboundEvent::parse(r#"{"type":"done","timestamp":"2024-01-01T00:00:00.000000Z"}"#)
            .unwrap();
        assert!(matches!(done, InboundEvent::End { timestamp: Some(_) }));

        let title =
            InboundEvent::parse(r#"{"type":"title_update","chat_id":12,"title":"Recipes"}"#).unwrap();
        assert_eq!(
            title,
            InboundEvent::Title {
                content: "Recipes".into(),
                session_id: Some("12".into())
            }
        );

        let bare = InboundEvent::parse(r#"{"error":"Missing required parameters"}"#).unwrap();
        assert!(bare.is_terminal());
    }

    #[test]
    fn parses_acknowledgement() {
        let ack = InboundEvent::parse(
            r#"{"type":"message","role":"user","content":"hello","id":9,"local_id":"loc_1"}"#,
        )
        .unwrap();
        let InboundEvent::Ack(ack) = ack else {
            panic!("expected ack");
        };
        assert_eq!(ack.id.as_deref(), Some("9"));
        assert_eq!(ack.local_id.as_deref(), Some("loc_1"));
        assert_eq!(ack.role, MessageRole::User);
    }

    #[test]
    fn rejects_unknown_and_malformed_payloads() {
        assert!(matches!(
            InboundEvent::parse(r#"{"type":"mystery"}"#),
            Err(ProtocolError::UnknownType(kind)) if kind == "mystery"
        ));
        assert!(matches!(
            InboundEvent::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            InboundEvent::parse(r#"{"type":"token"}"#),
            Err(ProtocolError::MissingField { kind: "token", .. })
        ));
    }

    #[test]
    fn outbound_payload_omits_absent_local_id() {
        assert_eq!(OutboundPayload::new("hi").to_json(), r#"{"content":"hi"}"#);
        let with_id = OutboundPayload::new("hi").with_local_id("loc_1");
        let value: serde_json::Value = serde_json::from_str(&with_id.to_json()).unwrap();
        assert_eq!(value["local_id"], "loc_1");
    }
}
