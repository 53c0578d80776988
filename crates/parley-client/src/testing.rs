//! Fakes shared by unit tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use parley_types::{HistoryEntry, Message, Session};

use crate::api::ChatApi;
use crate::channel::ChannelState;
use crate::error::ClientError;
use crate::notify::Notification;
use crate::render::RenderSink;

#[derive(Debug, Default)]
pub(crate) struct NoopApi;

static NEXT_SESSION: AtomicU32 = AtomicU32::new(1);

#[async_trait]
impl ChatApi for NoopApi {
    async fn list_sessions(&self) -> Result<Vec<Session>, ClientError> {
        Ok(Vec::new())
    }

    async fn create_session(&self) -> Result<Session, ClientError> {
        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        Ok(Session::new(format!("noop-{}", id), None, Utc::now()))
    }

    async fn delete_session(&self, _session_id: &str) -> Result<(), ClientError> {
        Ok(())
    }

    async fn fetch_history(&self, _session_id: &str) -> Result<Vec<HistoryEntry>, ClientError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Rendered {
    Appended(Message),
    Updated(Message),
    Fragment {
        session_id: String,
        key: String,
        delta: String,
    },
    Finalized(Message),
    Replaced(String),
    Renamed(Session),
    Active(Option<String>),
    Connection(ChannelState),
    Notified(Notification),
}

#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<Rendered>>,
}

impl RecordingSink {
    pub(crate) fn events(&self) -> Vec<Rendered> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, event: Rendered) {
        self.events.lock().unwrap().push(event);
    }
}

impl RenderSink for RecordingSink {
    fn message_appended(&self, message: &Message) {
        self.record(Rendered::Appended(message.clone()));
    }

    fn message_updated(&self, message: &Message) {
        self.record(Rendered::Updated(message.clone()));
    }

    fn fragment(&self, session_id: &str, key: &str, delta: &str) {
        self.record(Rendered::Fragment {
            session_id: session_id.to_string(),
            key: key.to_string(),
            delta: delta.to_string(),
        });
    }

    fn message_finalized(&self, message: &Message) {
        self.record(Rendered::Finalized(message.clone()));
    }

    fn transcript_replaced(&self, session_id: &str, _messages: &[Message]) {
        self.record(Rendered::Replaced(session_id.to_string()));
    }

    fn session_renamed(&self, session: &Session) {
        self.record(Rendered::Renamed(session.clone()));
    }

    fn active_session_changed(&self, session_id: Option<&str>) {
        self.record(Rendered::Active(session_id.map(str::to_string)));
    }

    fn connection_changed(&self, state: ChannelState) {
        self.record(Rendered::Connection(state));
    }

    fn notification(&self, notification: &Notification) {
        self.record(Rendered::Notified(notification.clone()));
    }
}
