use std::sync::Arc;

use parley_types::Session;
use tokio::sync::broadcast;

use crate::api::ChatApi;
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionChange {
    Listed,
    Created(Session),
    Deleted(String),
    Renamed(Session),
    ActiveChanged {
        previous: Option<String>,
        current: Option<String>,
    },
}

/// Known sessions, most recent first, plus the active one.
pub struct SessionStore {
    api: Arc<dyn ChatApi>,
    sessions: Vec<Session>,
    active: Option<String>,
    changes: broadcast::Sender<SessionChange>,
}

impl SessionStore {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            api,
            sessions: Vec::new(),
            active: None,
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionChange> {
        self.changes.subscribe()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn get(&self, session_id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == session_id)
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    fn publish(&self, change: SessionChange) {
        let _ = self.changes.send(change);
    }

    fn sort(&mut self) {
        self.sessions.sort_by(|a, b| b.recency().cmp(&a.recency()));
    }

    pub async fn list_sessions(&mut self) -> Result<&[Session], ClientError> {
        let sessions = self.api.list_sessions().await?;
        tracing::debug!(count = sessions.len(), "listed sessions");
        self.sessions = sessions;
        self.sort();
        self.publish(SessionChange::Listed);
        Ok(&self.sessions)
    }

    /// Create a session on the server. The active session is left alone.
    pub async fn create_session(&mut self) -> Result<Session, ClientError> {
        let session = self.api.create_session().await?;
        tracing::info!(session_id = %session.id, "created session");
        self.sessions.retain(|s| s.id != session.id);
        self.sessions.insert(0, session.clone());
        self.publish(SessionChange::Created(session.clone()));
        Ok(session)
    }

    /// Deleting an absent id succeeds. Returns true when the deleted session
    /// was the active one.
    pub async fn delete_session(&mut self, session_id: &str) -> Result<bool, ClientError> {
        self.api.delete_session(session_id).await?;
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != session_id);
        if before != self.sessions.len() {
            self.publish(SessionChange::Deleted(session_id.to_string()));
        }

        let was_active = self.active.as_deref() == Some(session_id);
        if was_active {
            self.active = None;
            self.publish(SessionChange::ActiveChanged {
                previous: Some(session_id.to_string()),
                current: None,
            });
        }
        Ok(was_active)
    }

    /// Returns false when `session_id` is already active.
    pub fn set_active(&mut self, session_id: &str) -> bool {
        if self.active.as_deref() == Some(session_id) {
            return false;
        }
        let previous = self.active.replace(session_id.to_string());
        self.publish(SessionChange::ActiveChanged {
            previous,
            current: Some(session_id.to_string()),
        });
        true
    }

    pub fn rename(&mut self, session_id: &str, title: &str) -> Option<&Session> {
        let idx = self.sessions.iter().position(|s| s.id == session_id)?;
        if self.sessions[idx].title.as_deref() == Some(title) {
            return Some(&self.sessions[idx]);
        }
        self.sessions[idx].title = Some(title.to_string());
        self.publish(SessionChange::Renamed(self.sessions[idx].clone()));
        Some(&self.sessions[idx])
    }
}
