use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parley_config::ClientSettings;
use parley_types::time::{deserialize_id, deserialize_timestamp_opt};
use parley_types::{HistoryEntry, Session};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::auth::{require_token, TokenSource};
use crate::error::ClientError;

/// Session CRUD and history endpoints.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<Session>, ClientError>;

    async fn create_session(&self) -> Result<Session, ClientError>;

    /// Deleting an id the server no longer knows succeeds.
    async fn delete_session(&self, session_id: &str) -> Result<(), ClientError>;

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ClientError>;
}

pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn TokenSource>,
}

impl HttpChatApi {
    pub fn new(settings: &ClientSettings, tokens: Arc<dyn TokenSource>) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: settings.api_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, what: &str, request: RequestBuilder) -> Result<Response, ClientError> {
        let token = require_token(self.tokens.as_ref())?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Auth(format!("{} rejected: {}", what, status)));
        }
        Err(ClientError::Network(format!(
            "Failed to {}: {} - {}",
            what, status, text
        )))
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        let request = self.client.get(self.url("/chat/chats"));
        let response = self.send("list sessions", request).await?;
        let raw: Vec<RawSession> = response.json().await?;
        Ok(raw.into_iter().map(RawSession::into_session).collect())
    }

    async fn create_session(&self) -> Result<Session, ClientError> {
        let request = self
            .client
            .post(self.url("/chat/chats"))
            .json(&serde_json::json!({}));
        let response = self.send("create session", request).await?;
        let raw: RawSession = response.json().await?;
        Ok(raw.into_session())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), ClientError> {
        let token = require_token(self.tokens.as_ref())?;
        let response = self
            .client
            .delete(self.url(&format!("/chat/chats/{}", session_id)))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Auth(format!("delete session rejected: {}", status)));
        }
        let text = response.text().await.unwrap_or_default();
        Err(ClientError::Network(format!(
            "Failed to delete session: {} - {}",
            status, text
        )))
    }

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ClientError> {
        let request = self
            .client
            .get(self.url(&format!("/chat/chats/{}/messages", session_id)));
        let response = self.send("fetch history", request).await?;
        Ok(response.json().await?)
    }
}

/// Session shape as the backend returns it; listings omit timestamps.
#[derive(Debug, Deserialize)]
struct RawSession {
    #[serde(deserialize_with = "deserialize_id")]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(
        default,
        alias = "createdAt",
        deserialize_with = "deserialize_timestamp_opt"
    )]
    created_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        alias = "updatedAt",
        deserialize_with = "deserialize_timestamp_opt"
    )]
    updated_at: Option<DateTime<Utc>>,
}

impl RawSession {
    fn into_session(self) -> Session {
        let mut session = Session::new(
            self.id,
            self.title,
            self.created_at.unwrap_or_else(Utc::now),
        );
        session.updated_at = self.updated_at;
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    #[test]
    fn raw_session_tolerates_missing_timestamps() {
        let raw: Vec<RawSession> =
            serde_json::from_str(r#"[{"id": 3, "title": "Rust"}, {"id": "a", "createdAt": "2024-01-01T00:00:00Z"}]"#)
                .unwrap();
        let sessions: Vec<Session> = raw.into_iter().map(RawSession::into_session).collect();
        assert_eq!(sessions[0].id, "3");
        assert_eq!(sessions[0].display_title(), "Rust");
        assert_eq!(sessions[1].created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn requests_without_token_fail_before_network() {
        let settings = ClientSettings {
            api_url: "http://127.0.0.1:9/api".into(),
            ..Default::default()
        };
        let api = HttpChatApi::new(&settings, Arc::new(StaticToken::new(None))).unwrap();

        assert!(api.create_session().await.unwrap_err().is_auth());
        assert!(api.delete_session("1").await.unwrap_err().is_auth());
        assert!(api.fetch_history("1").await.unwrap_err().is_auth());
    }
}
