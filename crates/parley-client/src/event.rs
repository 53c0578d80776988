use parley_types::HistoryEntry;

use crate::error::ClientError;

/// Work queued for the engine. Every asynchronous source (transport reader,
/// timers, REST responses) talks to the engine only through this type.
#[derive(Debug)]
pub enum EngineEvent {
    Channel(ChannelEvent),
    ReconnectDue {
        generation: u64,
        attempt: u32,
    },
    HistoryLoaded {
        session_id: String,
        ticket: u64,
        result: Result<Vec<HistoryEntry>, ClientError>,
    },
    ResyncTick {
        ticket: u64,
    },
    ResyncFetched {
        session_id: String,
        ticket: u64,
        result: Result<Vec<HistoryEntry>, ClientError>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub generation: u64,
    pub session_id: String,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    Frame(String),
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Requests a front end feeds into [`crate::ChatEngine::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListSessions,
    NewSession,
    Switch(String),
    Delete(String),
    Send(String),
    SendWithAttachment { content: String, file_ref: String },
    Reconnect,
    SetVisible(bool),
    Quit,
}
