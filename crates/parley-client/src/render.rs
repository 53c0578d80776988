//! Presentation seam.
//!
//! The engine reports every visible change through a [`RenderSink`]. Streaming
//! output arrives as deltas so a front end never has to redraw a transcript
//! while a reply is being generated.

use parley_types::{Message, Session};

use crate::channel::ChannelState;
use crate::notify::Notification;

#[allow(unused_variables)]
pub trait RenderSink: Send + Sync {
    fn message_appended(&self, message: &Message) {}

    /// Status or id of an existing entry changed.
    fn message_updated(&self, message: &Message) {}

    fn fragment(&self, session_id: &str, key: &str, delta: &str) {}

    fn message_finalized(&self, message: &Message) {}

    fn transcript_replaced(&self, session_id: &str, messages: &[Message]) {}

    fn sessions_listed(&self, sessions: &[Session]) {}

    fn session_renamed(&self, session: &Session) {}

    fn active_session_changed(&self, session_id: Option<&str>) {}

    fn connection_changed(&self, state: ChannelState) {}

    fn notification(&self, notification: &Notification) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RenderSink for NullSink {}
