//! Streaming chat client engine.
//!
//! The engine keeps a local transcript of each chat session consistent with
//! a backend that streams assistant replies over a live transport. See
//! [`ChatEngine`] for the entry point.

pub mod api;
pub mod auth;
pub mod channel;
pub mod context;
pub mod engine;
pub mod error;
pub mod event;
pub mod notify;
pub mod reducer;
pub mod render;
pub mod resync;
pub mod session_store;
pub mod transcript;
pub mod transport;

#[cfg(test)]
mod testing;

pub use api::{ChatApi, HttpChatApi};
pub use auth::{StaticToken, TokenSource};
pub use channel::{backoff_delay, ChannelManager, ChannelState};
pub use context::ClientContext;
pub use engine::ChatEngine;
pub use error::ClientError;
pub use event::{ChannelEvent, ChannelEventKind, Command, EngineEvent};
pub use notify::{Notification, NotificationCenter, NotificationLevel};
pub use reducer::{ReduceOutcome, StreamReducer};
pub use render::{NullSink, RenderSink};
pub use resync::ResyncAgent;
pub use session_store::{SessionChange, SessionStore};
pub use transcript::{CacheError, TranscriptCache};
pub use transport::{Connector, MemoryConnector, MemoryPeer, WebSocketConnector};
