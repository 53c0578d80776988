#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parley_client::{
    ChatApi, ChatEngine, ClientContext, ClientError, MemoryConnector, NullSink, StaticToken,
    TokenSource,
};
use parley_config::ClientSettings;
use parley_types::{HistoryEntry, MessageRole, Session};

/// Backend double. Every call fails with `Auth` while the shared token
/// source is empty, like the real server would.
pub struct FakeApi {
    tokens: Arc<StaticToken>,
    next_id: AtomicU32,
    pub history: Mutex<HashMap<String, Vec<HistoryEntry>>>,
    pub history_calls: AtomicU32,
}

impl FakeApi {
    pub fn new(tokens: Arc<StaticToken>) -> Self {
        Self {
            tokens,
            next_id: AtomicU32::new(1),
            history: Mutex::new(HashMap::new()),
            history_calls: AtomicU32::new(0),
        }
    }

    pub fn set_history(&self, session_id: &str, entries: Vec<HistoryEntry>) {
        self.history
            .lock()
            .unwrap()
            .insert(session_id.to_string(), entries);
    }

    fn check_token(&self) -> Result<(), ClientError> {
        match self.tokens.token() {
            Some(_) => Ok(()),
            None => Err(ClientError::Auth("no token available".into())),
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        self.check_token()?;
        Ok(Vec::new())
    }

    async fn create_session(&self) -> Result<Session, ClientError> {
        self.check_token()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(format!("new-{}", id), None, Utc::now()))
    }

    async fn delete_session(&self, _session_id: &str) -> Result<(), ClientError> {
        self.check_token()
    }

    async fn fetch_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>, ClientError> {
        self.check_token()?;
        self.history_calls.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .history
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct Harness {
    pub engine: ChatEngine,
    pub api: Arc<FakeApi>,
    pub connector: Arc<MemoryConnector>,
    pub tokens: Arc<StaticToken>,
}

/// Timers are pushed far out so tests drive retries and polls explicitly.
pub fn quiet_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();
    settings.reconnect.base_delay = Duration::from_secs(3600);
    settings.reconnect.max_delay = Duration::from_secs(3600);
    settings.resync.interval = Duration::from_secs(3600);
    settings
}

pub fn harness(token: Option<&str>) -> Harness {
    harness_with(token, quiet_settings())
}

pub fn harness_with(token: Option<&str>, settings: ClientSettings) -> Harness {
    let tokens = Arc::new(StaticToken::new(token.map(str::to_string)));
    let api = Arc::new(FakeApi::new(tokens.clone()));
    let connector = Arc::new(MemoryConnector::new());
    let ctx = ClientContext::new(
        settings,
        api.clone(),
        tokens.clone(),
        connector.clone(),
        Arc::new(NullSink),
    );
    Harness {
        engine: ChatEngine::new(ctx),
        api,
        connector,
        tokens,
    }
}

pub fn history(id: &str, role: MessageRole, content: &str, is_complete: Option<bool>) -> HistoryEntry {
    HistoryEntry {
        id: id.to_string(),
        role,
        content: content.to_string(),
        timestamp: None,
        is_complete,
    }
}

pub fn token(content: &str) -> serde_json::Value {
    serde_json::json!({"type": "token", "content": content})
}
