//! Folds inbound transport events into the transcript.

use parley_types::{InboundEvent, MessageStatus};

use crate::notify::{NotificationCenter, NotificationLevel};
use crate::render::RenderSink;
use crate::session_store::SessionStore;
use crate::transcript::TranscriptCache;

const NEED_FILE_FALLBACK: &str = "The assistant needs a file to continue.";

/// Everything one event may touch, borrowed from the engine.
pub struct ReduceContext<'a> {
    pub session_id: &'a str,
    pub transcript: &'a mut TranscriptCache,
    pub sessions: &'a mut SessionStore,
    pub notifications: &'a mut NotificationCenter,
    pub render: &'a dyn RenderSink,
}

impl ReduceContext<'_> {
    fn notify(&mut self, level: NotificationLevel, text: &str) {
        let notification = self.notifications.push(level, text);
        self.render.notification(&notification);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOutcome {
    Applied,
    /// Duplicate or late event; nothing changed.
    Ignored,
    /// Payload could not be parsed and was dropped.
    Rejected,
    TurnComplete,
    /// The turn failed; its transport should be closed.
    TurnFailed,
}

#[derive(Debug, Default)]
pub struct StreamReducer {
    turn_finished: bool,
    dropped: u64,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new turn was sent; fragments are accepted again.
    pub fn begin_turn(&mut self) {
        self.turn_finished = false;
    }

    /// The current turn was finalized outside the reducer.
    pub fn end_turn(&mut self) {
        self.turn_finished = true;
    }

    /// Malformed payloads dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn apply_frame(&mut self, cx: &mut ReduceContext<'_>, payload: &str) -> ReduceOutcome {
        match InboundEvent::parse(payload) {
            Ok(event) => self.apply(cx, event),
            Err(err) => {
                self.dropped += 1;
                tracing::warn!(session_id = cx.session_id, %err, "dropping inbound event");
                ReduceOutcome::Rejected
            }
        }
    }

    pub fn apply(&mut self, cx: &mut ReduceContext<'_>, event: InboundEvent) -> ReduceOutcome {
        let session_id = cx.session_id;
        tracing::trace!(session_id, kind = event.kind(), "inbound event");

        match event {
            InboundEvent::Token { content } => {
                if self.turn_finished && cx.transcript.streaming(session_id).is_none() {
                    tracing::debug!(session_id, "fragment after turn end ignored");
                    return ReduceOutcome::Ignored;
                }
                let update = cx.transcript.upsert_streaming(session_id, &content);
                if update.created {
                    if let Some(message) = cx.transcript.get(session_id, &update.key) {
                        cx.render.message_appended(message);
                    }
                } else {
                    cx.render.fragment(session_id, &update.key, &update.delta);
                }
                ReduceOutcome::Applied
            }
            InboundEvent::Title {
                content,
                session_id: target,
            } => {
                let target = target.as_deref().unwrap_or(session_id);
                if let Some(session) = cx.sessions.rename(target, &content) {
                    cx.render.session_renamed(session);
                }
                ReduceOutcome::Applied
            }
            InboundEvent::Error { content } => {
                match cx.transcript.finalize(session_id, MessageStatus::Failed) {
                    Some(message) => {
                        cx.render.message_finalized(message);
                        self.turn_finished = true;
                        tracing::warn!(session_id, error = %content, "turn failed");
                        cx.notify(NotificationLevel::Error, &content);
                        ReduceOutcome::TurnFailed
                    }
                    None if self.turn_finished => ReduceOutcome::Ignored,
                    None => {
                        tracing::warn!(session_id, error = %content, "server error outside a turn");
                        cx.notify(NotificationLevel::Error, &content);
                        ReduceOutcome::Applied
                    }
                }
            }
            InboundEvent::End { .. } => {
                match cx.transcript.finalize(session_id, MessageStatus::Complete) {
                    Some(message) => {
                        cx.render.message_finalized(message);
                        self.turn_finished = true;
                        ReduceOutcome::TurnComplete
                    }
                    None => ReduceOutcome::Ignored,
                }
            }
            InboundEvent::Ack(ack) => match cx.transcript.acknowledge(session_id, &ack) {
                Some(message) => {
                    cx.render.message_updated(message);
                    ReduceOutcome::Applied
                }
                None => ReduceOutcome::Ignored,
            },
            InboundEvent::NeedFile { content } => {
                let text = if content.trim().is_empty() {
                    NEED_FILE_FALLBACK
                } else {
                    content.as_str()
                };
                cx.notify(NotificationLevel::Info, text);
                ReduceOutcome::Applied
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{NoopApi, RecordingSink, Rendered};
    use parley_types::{Message, MessageRole};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        transcript: TranscriptCache,
        sessions: SessionStore,
        notifications: NotificationCenter,
        sink: RecordingSink,
        reducer: StreamReducer,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                transcript: TranscriptCache::new(),
                sessions: SessionStore::new(Arc::new(NoopApi)),
                notifications: NotificationCenter::new(Duration::from_secs(3)),
                sink: RecordingSink::default(),
                reducer: StreamReducer::new(),
            }
        }

        fn feed(&mut self, payload: &str) -> ReduceOutcome {
            let mut cx = ReduceContext {
                session_id: "s1",
                transcript: &mut self.transcript,
                sessions: &mut self.sessions,
                notifications: &mut self.notifications,
                render: &self.sink,
            };
            self.reducer.apply_frame(&mut cx, payload)
        }

        fn start_turn(&mut self, text: &str) {
            let mut user = Message::user_pending("s1", text);
            user.status = MessageStatus::Complete;
            self.transcript.append(user).unwrap();
            self.transcript
                .append(Message::assistant_streaming("s1"))
                .unwrap();
            self.reducer.begin_turn();
        }
    }

    #[test]
    fn tokens_then_end_complete_the_reply() {
        let mut fx = Fixture::new();
        fx.start_turn("hello");

        assert_eq!(fx.feed(r#"{"type":"token","content":"Hi"}"#), ReduceOutcome::Applied);
        assert_eq!(fx.feed(r#"{"type":"token","content":" there"}"#), ReduceOutcome::Applied);
        assert_eq!(fx.feed(r#"{"type":"end"}"#), ReduceOutcome::TurnComplete);

        let reply = &fx.transcript.messages("s1")[1];
        assert_eq!(reply.role, MessageRole::Assistant);
        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.status, MessageStatus::Complete);

        let deltas: Vec<String> = fx
            .sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Fragment { delta, .. } => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["Hi", " there"]);
    }

    #[test]
    fn duplicate_terminal_events_are_ignored() {
        let mut fx = Fixture::new();
        fx.start_turn("q");
        fx.feed(r#"{"type":"token","content":"A"}"#);
        fx.feed(r#"{"type":"done"}"#);
        let snapshot = fx.transcript.messages("s1").to_vec();

        assert_eq!(fx.feed(r#"{"type":"end"}"#), ReduceOutcome::Ignored);
        assert_eq!(
            fx.feed(r#"{"type":"error","content":"late"}"#),
            ReduceOutcome::Ignored
        );
        assert_eq!(fx.feed(r#"{"type":"token","content":"B"}"#), ReduceOutcome::Ignored);
        assert_eq!(fx.transcript.messages("s1"), snapshot.as_slice());
        assert!(fx.notifications.active(chrono::Utc::now()).is_empty());
    }

    #[test]
    fn error_fails_the_turn_and_notifies() {
        let mut fx = Fixture::new();
        fx.start_turn("q");
        fx.feed(r#"{"type":"token","content":"par"}"#);

        assert_eq!(
            fx.feed(r#"{"type":"error","content":"model unavailable"}"#),
            ReduceOutcome::TurnFailed
        );
        let reply = &fx.transcript.messages("s1")[1];
        assert_eq!(reply.status, MessageStatus::Failed);
        assert_eq!(reply.content, "par");

        let live = fx.notifications.active(chrono::Utc::now());
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].level, NotificationLevel::Error);
        assert_eq!(live[0].text, "model unavailable");
    }

    #[test]
    fn malformed_payloads_are_dropped_and_stream_continues() {
        let mut fx = Fixture::new();
        fx.start_turn("q");
        assert_eq!(fx.feed("not json"), ReduceOutcome::Rejected);
        assert_eq!(fx.feed(r#"{"type":"mystery"}"#), ReduceOutcome::Rejected);
        assert_eq!(fx.feed(r#"{"type":"token","content":"ok"}"#), ReduceOutcome::Applied);
        assert_eq!(fx.reducer.dropped(), 2);
        assert_eq!(fx.transcript.streaming("s1").unwrap().content, "ok");
    }

    #[tokio::test]
    async fn title_renames_without_touching_transcript() {
        let mut fx = Fixture::new();
        fx.sessions.create_session().await.unwrap();
        let id = fx.sessions.sessions()[0].id.clone();
        fx.start_turn("q");
        let before = fx.transcript.messages("s1").to_vec();

        let payload = serde_json::json!({"type": "title_update", "chat_id": id, "title": "Lifetimes"});
        assert_eq!(fx.feed(&payload.to_string()), ReduceOutcome::Applied);

        assert_eq!(fx.sessions.get(&id).unwrap().display_title(), "Lifetimes");
        assert_eq!(fx.transcript.messages("s1"), before.as_slice());
    }

    #[test]
    fn ack_attaches_server_id() {
        let mut fx = Fixture::new();
        fx.start_turn("hello");
        let payload = r#"{"type":"message","role":"user","content":"hello","id":9,"timestamp":"2024-01-01T00:00:00.000000Z"}"#;
        assert_eq!(fx.feed(payload), ReduceOutcome::Applied);
        assert_eq!(fx.transcript.messages("s1")[0].id.as_deref(), Some("9"));
    }

    #[test]
    fn need_file_only_notifies() {
        let mut fx = Fixture::new();
        fx.start_turn("summarise my file");
        let before = fx.transcript.messages("s1").to_vec();

        assert_eq!(fx.feed(r#"{"type":"need_file"}"#), ReduceOutcome::Applied);
        assert_eq!(fx.transcript.messages("s1"), before.as_slice());
        let live = fx.notifications.active(chrono::Utc::now());
        assert_eq!(live[0].level, NotificationLevel::Info);
        assert_eq!(live[0].text, NEED_FILE_FALLBACK);
    }

    #[test]
    fn fragment_without_placeholder_starts_a_reply() {
        let mut fx = Fixture::new();
        fx.feed(r#"{"type":"token","content":"server-initiated"}"#);
        assert_eq!(fx.transcript.streaming_count("s1"), 1);
        assert!(matches!(fx.sink.events()[0], Rendered::Appended(_)));
    }
}
