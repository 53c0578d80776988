//! Repairs the transcript when a stream drops.
//!
//! While a turn is outstanding the agent polls the history endpoint on a
//! fixed interval, and immediately when the client becomes visible again.
//! Once the server reports the turn finished, the local streaming message is
//! finalized with the server's content and the transcript is merged with
//! the server copy. Polls only count while no fragments arrive; after
//! `max_polls` silent polls the turn is given up.

use parley_config::ResyncPolicy;
use parley_types::{history_to_messages, HistoryEntry, MessageRole, MessageStatus};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;
use crate::event::EngineEvent;
use crate::transcript::TranscriptCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncAction {
    Idle,
    Fetch { session_id: String, ticket: u64 },
    GiveUp { session_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncVerdict {
    /// The response belongs to a superseded poll.
    Stale,
    /// Server has not finished the turn yet.
    Pending,
    /// Not finished, but earlier history was merged in front of the turn.
    Seeded,
    Resolved { finalized: bool },
}

struct Armed {
    session_id: String,
    polls: u32,
    in_flight: bool,
    cancel: CancellationToken,
}

pub struct ResyncAgent {
    policy: ResyncPolicy,
    events: mpsc::UnboundedSender<EngineEvent>,
    ticket: u64,
    armed: Option<Armed>,
    visible: bool,
}

impl ResyncAgent {
    pub fn new(policy: ResyncPolicy, events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            policy,
            events,
            ticket: 0,
            armed: None,
            visible: true,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn armed_session(&self) -> Option<&str> {
        self.armed.as_ref().map(|a| a.session_id.as_str())
    }

    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Start watching `session_id`. Replaces any previous watch.
    pub fn arm(&mut self, session_id: &str) {
        self.disarm();
        self.ticket += 1;
        let cancel = CancellationToken::new();
        self.spawn_ticker(self.ticket, cancel.clone());
        tracing::debug!(session_id, ticket = self.ticket, "resync armed");
        self.armed = Some(Armed {
            session_id: session_id.to_string(),
            polls: 0,
            in_flight: false,
            cancel,
        });
    }

    pub fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            armed.cancel.cancel();
            tracing::debug!(session_id = %armed.session_id, "resync disarmed");
        }
    }

    /// Fragments are still arriving; the silent-poll budget starts over.
    pub fn note_progress(&mut self) {
        if let Some(armed) = self.armed.as_mut() {
            armed.polls = 0;
        }
    }

    fn spawn_ticker(&self, ticket: u64, cancel: CancellationToken) {
        let events = self.events.clone();
        let period = self.policy.interval;
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if events.send(EngineEvent::ResyncTick { ticket }).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    pub fn on_tick(&mut self, ticket: u64) -> ResyncAction {
        if ticket != self.ticket {
            return ResyncAction::Idle;
        }
        self.request()
    }

    /// Returns a fetch when visibility is regained during an outstanding
    /// turn.
    pub fn set_visible(&mut self, visible: bool) -> ResyncAction {
        let regained = visible && !self.visible;
        self.visible = visible;
        if regained {
            self.request()
        } else {
            ResyncAction::Idle
        }
    }

    /// Fetch now, e.g. after the transport dropped mid-turn. Counts as a
    /// poll.
    pub fn poll_now(&mut self) -> ResyncAction {
        self.request()
    }

    fn request(&mut self) -> ResyncAction {
        let max_polls = self.policy.max_polls;
        let Some(armed) = self.armed.as_mut() else {
            return ResyncAction::Idle;
        };
        if armed.in_flight {
            return ResyncAction::Idle;
        }
        armed.polls += 1;
        if armed.polls > max_polls {
            let session_id = armed.session_id.clone();
            self.disarm();
            return ResyncAction::GiveUp { session_id };
        }
        armed.in_flight = true;
        ResyncAction::Fetch {
            session_id: armed.session_id.clone(),
            ticket: self.ticket,
        }
    }

    /// Apply a fetched snapshot.
    pub fn reconcile(
        &mut self,
        session_id: &str,
        ticket: u64,
        result: Result<Vec<HistoryEntry>, ClientError>,
        transcript: &mut TranscriptCache,
    ) -> ResyncVerdict {
        let Some(armed) = self.armed.as_mut() else {
            return ResyncVerdict::Stale;
        };
        if ticket != self.ticket || armed.session_id != session_id {
            return ResyncVerdict::Stale;
        }
        armed.in_flight = false;

        let entries = match result {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(session_id, %err, "resync fetch failed");
                return ResyncVerdict::Pending;
            }
        };

        if transcript.streaming(session_id).is_none() {
            self.disarm();
            return ResyncVerdict::Resolved { finalized: false };
        }

        let anchor = locate_turn(&entries, transcript, session_id);
        let answer = match (anchor, entries.last()) {
            (Some(anchor), Some(last))
                if entries.len() - 1 > anchor && last.is_finished_assistant() =>
            {
                Some(last.clone())
            }
            _ => None,
        };

        let Some(answer) = answer else {
            if transcript.is_synced(session_id) {
                return ResyncVerdict::Pending;
            }
            // First snapshot for this session: everything before the
            // server's copy of the turn is earlier history.
            let mut history = history_to_messages(session_id, entries);
            if let Some(anchor) = anchor {
                history.truncate(anchor);
            }
            return if transcript.seed_history(session_id, history) {
                tracing::debug!(session_id, "earlier history merged ahead of outstanding turn");
                ResyncVerdict::Seeded
            } else {
                ResyncVerdict::Pending
            };
        };

        let finalized = transcript
            .finalize_with(
                session_id,
                MessageStatus::Complete,
                answer.content,
                Some(answer.id),
            )
            .is_some();
        transcript.replace_all(session_id, history_to_messages(session_id, entries));
        self.disarm();
        tracing::info!(session_id, finalized, "transcript reconciled with server");
        ResyncVerdict::Resolved { finalized }
    }
}

impl Drop for ResyncAgent {
    fn drop(&mut self) {
        self.disarm();
    }
}

/// Index of the server's copy of the user turn the streaming reply answers.
///
/// Matched by server id once acknowledged, else by content. On a synced
/// transcript the server must also hold as many user turns up to that point
/// as the cache delivered, so an earlier turn with the same text is not
/// taken for the current one.
fn locate_turn(entries: &[HistoryEntry], transcript: &TranscriptCache, session_id: &str) -> Option<usize> {
    let user = transcript.outstanding_user(session_id)?;
    let anchor = entries.iter().rposition(|e| {
        e.role == MessageRole::User
            && match user.id.as_deref() {
                Some(id) => e.id == id,
                None => e.content == user.content,
            }
    })?;

    if transcript.is_synced(session_id) {
        let server_turns = entries[..=anchor]
            .iter()
            .filter(|e| e.role == MessageRole::User)
            .count();
        let local_turns = transcript
            .messages(session_id)
            .iter()
            .filter(|m| m.role == MessageRole::User && m.status != MessageStatus::Failed)
            .count();
        if server_turns < local_turns {
            return None;
        }
    }
    Some(anchor)
}
