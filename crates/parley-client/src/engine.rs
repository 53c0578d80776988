//! The event loop.
//!
//! [`ChatEngine`] owns every component and processes one queued event at a
//! time. Background work (transport readers, timers, REST calls) never
//! touches state directly; it posts an [`EngineEvent`] and the engine applies
//! it after checking that it still belongs to the current link, session or
//! poll.

use std::time::Duration;

use chrono::Utc;
use parley_types::{
    history_to_messages, Message, MessageRole, MessageStatus, OutboundPayload, Session,
};
use tokio::sync::{broadcast, mpsc};

use crate::channel::{ChannelManager, ChannelState, CloseOutcome, RetryOutcome};
use crate::context::ClientContext;
use crate::error::ClientError;
use crate::event::{ChannelEvent, ChannelEventKind, Command, EngineEvent};
use crate::notify::{Notification, NotificationCenter, NotificationLevel};
use crate::reducer::{ReduceContext, ReduceOutcome, StreamReducer};
use crate::resync::{ResyncAction, ResyncAgent, ResyncVerdict};
use crate::session_store::{SessionChange, SessionStore};
use crate::transcript::{CacheError, TranscriptCache};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

pub struct ChatEngine {
    ctx: ClientContext,
    sessions: SessionStore,
    transcripts: TranscriptCache,
    channel: ChannelManager,
    reducer: StreamReducer,
    resync: ResyncAgent,
    notifications: NotificationCenter,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    history_ticket: u64,
    last_state: ChannelState,
    fatal: Option<ClientError>,
}

impl ChatEngine {
    pub fn new(ctx: ClientContext) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = SessionStore::new(ctx.api.clone());
        let channel = ChannelManager::new(
            ctx.connector.clone(),
            ctx.tokens.clone(),
            ctx.settings.ws_url.clone(),
            ctx.settings.reconnect,
            events_tx.clone(),
        );
        let resync = ResyncAgent::new(ctx.settings.resync, events_tx.clone());
        let notifications = NotificationCenter::new(ctx.settings.notification_ttl);

        Self {
            ctx,
            sessions,
            transcripts: TranscriptCache::new(),
            channel,
            reducer: StreamReducer::new(),
            resync,
            notifications,
            events_tx,
            events_rx,
            history_ticket: 0,
            last_state: ChannelState::Closed,
            fatal: None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn sessions(&self) -> &[Session] {
        self.sessions.sessions()
    }

    pub fn subscribe_sessions(&self) -> broadcast::Receiver<SessionChange> {
        self.sessions.subscribe()
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.sessions.active_id()
    }

    pub fn transcript(&self, session_id: &str) -> &[Message] {
        self.transcripts.messages(session_id)
    }

    pub fn active_transcript(&self) -> &[Message] {
        match self.sessions.active_id() {
            Some(id) => self.transcripts.messages(id),
            None => &[],
        }
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn resync(&self) -> &ResyncAgent {
        &self.resync
    }

    pub fn notifications(&mut self) -> &[Notification] {
        self.notifications.active(Utc::now())
    }

    /// An authentication failure that ended the current run, if any.
    pub fn take_fatal(&mut self) -> Option<ClientError> {
        self.fatal.take()
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub async fn list_sessions(&mut self) -> Result<Vec<Session>, ClientError> {
        let sessions = self.sessions.list_sessions().await?.to_vec();
        self.ctx.render.sessions_listed(&sessions);
        Ok(sessions)
    }

    /// Create a session and make it active. On failure the active session
    /// and its transport are left untouched.
    pub async fn new_session(&mut self) -> Result<Session, ClientError> {
        let session = self.sessions.create_session().await?;
        self.activate(&session.id).await?;
        Ok(session)
    }

    /// Make `session_id` active: the previous session's turn is failed and
    /// its transport closed, history is loaded and a transport is opened.
    ///
    /// Only authentication failures are returned; a failed connect is
    /// reported as a notification and can be retried with [`Self::reconnect`].
    pub async fn activate(&mut self, session_id: &str) -> Result<(), ClientError> {
        if self.sessions.active_id() == Some(session_id) {
            return Ok(());
        }
        if let Some(previous) = self.sessions.active_id().map(str::to_string) {
            self.leave_session(&previous);
        }

        self.sessions.set_active(session_id);
        self.ctx.render.active_session_changed(Some(session_id));
        tracing::info!(session_id, "session activated");

        self.load_history(session_id);
        match self.channel.connect(session_id).await {
            Ok(()) => {
                self.sync_connection_state();
                Ok(())
            }
            Err(err) if err.is_auth() => {
                self.sync_connection_state();
                Err(err)
            }
            Err(err) => {
                self.sync_connection_state();
                self.report(NotificationLevel::Warning, format!("Could not connect: {}", err), &err);
                Ok(())
            }
        }
    }

    pub async fn delete_session(&mut self, session_id: &str) -> Result<(), ClientError> {
        let was_active = self.sessions.delete_session(session_id).await?;
        if was_active {
            self.leave_session(session_id);
            self.ctx.render.active_session_changed(None);
        }
        self.transcripts.remove_session(session_id);
        Ok(())
    }

    fn leave_session(&mut self, session_id: &str) {
        if let Some(message) = self.transcripts.finalize(session_id, MessageStatus::Failed) {
            self.ctx.render.message_finalized(message);
            tracing::debug!(session_id, "in-flight reply failed on session switch");
        }
        self.reducer.end_turn();
        self.resync.disarm();
        self.channel.close();
        self.sync_connection_state();
    }

    fn load_history(&mut self, session_id: &str) {
        self.history_ticket += 1;
        let ticket = self.history_ticket;
        let api = self.ctx.api.clone();
        let events = self.events_tx.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = api.fetch_history(&session_id).await;
            let _ = events.send(EngineEvent::HistoryLoaded {
                session_id,
                ticket,
                result,
            });
        });
    }

    // ------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------

    /// Send a user turn on the active session.
    ///
    /// The user message is appended before anything goes on the wire. If the
    /// transport cannot take it, the message stays in the transcript as
    /// `Failed`. On success an assistant placeholder starts streaming and the
    /// resync agent watches the turn. Returns the user message's local id.
    pub async fn send(&mut self, content: &str) -> Result<String, ClientError> {
        let session_id = self
            .sessions
            .active_id()
            .ok_or(ClientError::NoActiveSession)?
            .to_string();
        if self.transcripts.streaming(&session_id).is_some() {
            return Err(CacheError::StreamingConflict { session_id }.into());
        }

        let user = Message::user_pending(&session_id, content);
        let local_id = user.local_id.clone().unwrap_or_default();
        self.transcripts.append(user.clone())?;
        self.ctx.render.message_appended(&user);

        let payload = OutboundPayload::new(content).with_local_id(&local_id);
        let delivered = match self.ensure_open(&session_id).await {
            Ok(()) => self.channel.send(&payload),
            Err(err) => Err(err),
        };

        if let Err(err) = delivered {
            if let Some(message) =
                self.transcripts
                    .set_status(&session_id, &local_id, MessageStatus::Failed)
            {
                self.ctx.render.message_updated(message);
            }
            self.report(NotificationLevel::Error, format!("Message not sent: {}", err), &err);
            return Err(err);
        }

        if let Some(message) =
            self.transcripts
                .set_status(&session_id, &local_id, MessageStatus::Complete)
        {
            self.ctx.render.message_updated(message);
        }

        let placeholder = Message::assistant_streaming(&session_id);
        self.transcripts.append(placeholder.clone())?;
        self.ctx.render.message_appended(&placeholder);
        self.reducer.begin_turn();
        self.resync.arm(&session_id);
        tracing::debug!(session_id = %session_id, local_id = %local_id, "turn sent");
        Ok(local_id)
    }

    /// Send a turn that references an already-uploaded file.
    pub async fn send_with_attachment(
        &mut self,
        content: &str,
        file_ref: &str,
    ) -> Result<String, ClientError> {
        let body = if content.trim().is_empty() {
            file_ref.to_string()
        } else {
            format!("{}\n{}", content, file_ref)
        };
        self.send(&body).await
    }

    async fn ensure_open(&mut self, session_id: &str) -> Result<(), ClientError> {
        match self.channel.state() {
            ChannelState::Open if self.channel.session_id() == Some(session_id) => Ok(()),
            ChannelState::Reconnecting { .. } => Err(ClientError::NotConnected),
            _ => {
                let result = self.channel.connect(session_id).await;
                self.sync_connection_state();
                result
            }
        }
    }

    /// Explicit reconnect, e.g. after the retry budget ran out.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        let session_id = self
            .sessions
            .active_id()
            .ok_or(ClientError::NoActiveSession)?
            .to_string();
        let result = self.channel.connect(&session_id).await;
        self.sync_connection_state();
        result
    }

    /// Visibility of the front end. Regaining it during an outstanding turn
    /// triggers an immediate resync.
    pub fn set_visible(&mut self, visible: bool) {
        let action = self.resync.set_visible(visible);
        self.perform_resync(action);
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Wait for the next queued event and apply it.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.dispatch(event).await;
                true
            }
            None => false,
        }
    }

    /// Apply the next queued event if one is ready.
    pub async fn try_step(&mut self) -> bool {
        match self.events_rx.try_recv() {
            Ok(event) => {
                self.dispatch(event).await;
                true
            }
            Err(_) => false,
        }
    }

    pub async fn dispatch(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Channel(event) => self.on_channel_event(event),
            EngineEvent::ReconnectDue {
                generation,
                attempt,
            } => self.on_reconnect_due(generation, attempt).await,
            EngineEvent::HistoryLoaded {
                session_id,
                ticket,
                result,
            } => self.on_history_loaded(session_id, ticket, result),
            EngineEvent::ResyncTick { ticket } => {
                let action = self.resync.on_tick(ticket);
                self.perform_resync(action);
            }
            EngineEvent::ResyncFetched {
                session_id,
                ticket,
                result,
            } => self.on_resync_fetched(session_id, ticket, result),
        }
    }

    /// Drive the engine from front-end commands until `Quit`, the command
    /// channel closes, or credentials are rejected.
    pub async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<(), ClientError> {
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            if let Some(err) = self.fatal.take() {
                self.shutdown();
                return Err(err);
            }

            tokio::select! {
                command = commands.recv() => {
                    let command = match command {
                        None | Some(Command::Quit) => break,
                        Some(command) => command,
                    };
                    if let Err(err) = self.handle_command(command).await {
                        self.shutdown();
                        return Err(err);
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    self.dispatch(event).await;
                }
                _ = housekeeping.tick() => {
                    self.notifications.prune(Utc::now());
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Runs one command. Only authentication failures are returned; other
    /// failures become notifications.
    async fn handle_command(&mut self, command: Command) -> Result<(), ClientError> {
        let (result, is_send) = match command {
            Command::ListSessions => (self.list_sessions().await.map(drop), false),
            Command::NewSession => (self.new_session().await.map(drop), false),
            Command::Switch(id) => (self.activate(&id).await, false),
            Command::Delete(id) => (self.delete_session(&id).await, false),
            Command::Send(content) => (self.send(&content).await.map(drop), true),
            Command::SendWithAttachment { content, file_ref } => (
                self.send_with_attachment(&content, &file_ref).await.map(drop),
                true,
            ),
            Command::Reconnect => (self.reconnect().await, false),
            Command::SetVisible(visible) => {
                self.set_visible(visible);
                (Ok(()), false)
            }
            Command::Quit => (Ok(()), false),
        };

        match result {
            Err(err) if err.is_auth() => Err(err),
            Err(err) => {
                // `send` already reported delivery failures.
                let reported = is_send
                    && matches!(err, ClientError::Connect(_) | ClientError::NotConnected);
                if !reported {
                    self.report(NotificationLevel::Error, err.to_string(), &err);
                }
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    pub fn shutdown(&mut self) {
        self.resync.disarm();
        self.channel.close();
        self.sync_connection_state();
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn on_channel_event(&mut self, event: ChannelEvent) {
        if !self.channel.is_current(event.generation)
            || self.sessions.active_id() != Some(event.session_id.as_str())
        {
            tracing::trace!(generation = event.generation, "stale transport event dropped");
            return;
        }

        match event.kind {
            ChannelEventKind::Frame(payload) => {
                let render = self.ctx.render.clone();
                let mut cx = ReduceContext {
                    session_id: &event.session_id,
                    transcript: &mut self.transcripts,
                    sessions: &mut self.sessions,
                    notifications: &mut self.notifications,
                    render: render.as_ref(),
                };
                match self.reducer.apply_frame(&mut cx, &payload) {
                    ReduceOutcome::Applied => self.resync.note_progress(),
                    ReduceOutcome::TurnComplete => self.resync.disarm(),
                    ReduceOutcome::TurnFailed => {
                        self.resync.disarm();
                        self.channel.close();
                        self.sync_connection_state();
                    }
                    ReduceOutcome::Ignored | ReduceOutcome::Rejected => {}
                }
            }
            ChannelEventKind::Closed { code, reason } => {
                tracing::info!(
                    session_id = %event.session_id,
                    ?code,
                    reason = reason.as_deref().unwrap_or(""),
                    "transport closed by peer"
                );
                let outcome = self.channel.on_closed(event.generation, code);
                self.sync_connection_state();
                match outcome {
                    CloseOutcome::AuthRejected => self.credentials_rejected(),
                    CloseOutcome::Reconnecting { .. } => {
                        // The reply may have finished while the link was down.
                        let action = self.resync.poll_now();
                        self.perform_resync(action);
                    }
                    CloseOutcome::Ignored => {}
                }
            }
        }
    }

    async fn on_reconnect_due(&mut self, generation: u64, attempt: u32) {
        let outcome = self.channel.retry(generation, attempt).await;
        self.sync_connection_state();
        match outcome {
            RetryOutcome::Exhausted { attempts } => {
                let err = ClientError::ConnectionLost { attempts };
                self.notify(NotificationLevel::Error, err.to_string());
            }
            RetryOutcome::AuthRejected => self.credentials_rejected(),
            RetryOutcome::Connected => {
                tracing::info!(attempt, "transport restored");
            }
            RetryOutcome::Scheduled { .. } | RetryOutcome::Ignored => {}
        }
    }

    fn on_history_loaded(
        &mut self,
        session_id: String,
        ticket: u64,
        result: Result<Vec<parley_types::HistoryEntry>, ClientError>,
    ) {
        if ticket != self.history_ticket || self.sessions.active_id() != Some(session_id.as_str()) {
            tracing::debug!(session_id = %session_id, "stale history response dropped");
            return;
        }

        let entries = match result {
            Ok(entries) => entries,
            Err(err) if err.is_auth() => {
                self.credentials_rejected();
                return;
            }
            Err(err) => {
                self.notify(
                    NotificationLevel::Error,
                    format!("Could not load history: {}", err),
                );
                return;
            }
        };

        // A turn sent before the history arrived: the snapshot is merged in
        // front of it, or answers it if the server already finished.
        if self.transcripts.streaming(&session_id).is_some()
            && self.resync.armed_session() == Some(session_id.as_str())
        {
            let ticket = self.resync.ticket();
            self.on_resync_fetched(session_id, ticket, Ok(entries));
            return;
        }

        let server_streaming = entries
            .last()
            .map(|e| e.role == MessageRole::Assistant && e.is_complete == Some(false))
            .unwrap_or(false);
        self.transcripts
            .replace_all(&session_id, history_to_messages(&session_id, entries));
        self.ctx
            .render
            .transcript_replaced(&session_id, self.transcripts.messages(&session_id));

        if server_streaming && !self.resync.is_armed() {
            self.reducer.begin_turn();
            self.resync.arm(&session_id);
        }
    }

    fn perform_resync(&mut self, action: ResyncAction) {
        match action {
            ResyncAction::Idle => {}
            ResyncAction::Fetch { session_id, ticket } => {
                let api = self.ctx.api.clone();
                let events = self.events_tx.clone();
                tokio::spawn(async move {
                    let result = api.fetch_history(&session_id).await;
                    let _ = events.send(EngineEvent::ResyncFetched {
                        session_id,
                        ticket,
                        result,
                    });
                });
            }
            ResyncAction::GiveUp { session_id } => {
                if let Some(message) = self.transcripts.finalize(&session_id, MessageStatus::Failed) {
                    self.ctx.render.message_finalized(message);
                }
                self.reducer.end_turn();
                tracing::warn!(session_id = %session_id, "reply could not be recovered");
                self.notify(
                    NotificationLevel::Error,
                    "The reply could not be recovered. Try sending it again.",
                );
            }
        }
    }

    fn on_resync_fetched(
        &mut self,
        session_id: String,
        ticket: u64,
        result: Result<Vec<parley_types::HistoryEntry>, ClientError>,
    ) {
        match self
            .resync
            .reconcile(&session_id, ticket, result, &mut self.transcripts)
        {
            ResyncVerdict::Resolved { .. } => {
                self.reducer.end_turn();
                self.ctx
                    .render
                    .transcript_replaced(&session_id, self.transcripts.messages(&session_id));
            }
            ResyncVerdict::Seeded => {
                self.ctx
                    .render
                    .transcript_replaced(&session_id, self.transcripts.messages(&session_id));
            }
            ResyncVerdict::Pending | ResyncVerdict::Stale => {}
        }
    }

    fn credentials_rejected(&mut self) {
        if let Some(session_id) = self.sessions.active_id().map(str::to_string) {
            if let Some(message) = self.transcripts.finalize(&session_id, MessageStatus::Failed) {
                self.ctx.render.message_finalized(message);
            }
        }
        self.reducer.end_turn();
        self.resync.disarm();
        self.notify(
            NotificationLevel::Error,
            "Your session has expired. Please sign in again.",
        );
        self.fatal = Some(ClientError::Auth("credentials rejected".to_string()));
    }

    fn notify(&mut self, level: NotificationLevel, text: impl Into<String>) {
        let notification = self.notifications.push(level, text);
        self.ctx.render.notification(&notification);
    }

    /// Notify about `err`, flagged as retriable when trying again can help.
    fn report(&mut self, level: NotificationLevel, text: String, err: &ClientError) {
        let notification = if err.is_retriable() {
            self.notifications.push_retriable(level, text)
        } else {
            self.notifications.push(level, text)
        };
        self.ctx.render.notification(&notification);
    }

    fn sync_connection_state(&mut self) {
        let state = self.channel.state();
        if state != self.last_state {
            self.last_state = state;
            self.ctx.render.connection_changed(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::testing::{NoopApi, RecordingSink, Rendered};
    use crate::transport::MemoryConnector;
    use parley_config::ClientSettings;
    use std::sync::Arc;

    fn engine(token: Option<&str>) -> (ChatEngine, Arc<MemoryConnector>, Arc<RecordingSink>) {
        let connector = Arc::new(MemoryConnector::new());
        let sink = Arc::new(RecordingSink::default());
        let mut settings = ClientSettings::default();
        settings.resync.interval = Duration::from_secs(3600);
        settings.reconnect.base_delay = Duration::from_secs(3600);
        settings.reconnect.max_delay = Duration::from_secs(3600);
        let ctx = ClientContext::new(
            settings,
            Arc::new(NoopApi),
            Arc::new(StaticToken::new(token.map(str::to_string))),
            connector.clone(),
            sink.clone(),
        );
        (ChatEngine::new(ctx), connector, sink)
    }

    #[tokio::test]
    async fn send_without_session_is_rejected() {
        let (mut engine, _, _) = engine(Some("tok"));
        assert!(matches!(
            engine.send("hi").await,
            Err(ClientError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn connection_changes_are_rendered_once() {
        let (mut engine, _, sink) = engine(Some("tok"));
        engine.activate("s1").await.unwrap();
        engine.activate("s1").await.unwrap();

        let states: Vec<ChannelState> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Rendered::Connection(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ChannelState::Open]);
    }

    #[tokio::test]
    async fn send_while_streaming_is_a_conflict() {
        let (mut engine, _, _) = engine(Some("tok"));
        engine.activate("s1").await.unwrap();
        engine.send("one").await.unwrap();

        let err = engine.send("two").await.unwrap_err();
        assert!(matches!(err, ClientError::Cache(CacheError::StreamingConflict { .. })));
        assert_eq!(engine.active_transcript().len(), 2);
    }

    #[tokio::test]
    async fn attachment_reference_travels_as_content() {
        let (mut engine, connector, _) = engine(Some("tok"));
        engine.activate("s1").await.unwrap();
        engine
            .send_with_attachment("summarise", "file://uploads/42")
            .await
            .unwrap();

        let mut peer = connector.take_peer().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&peer.try_recv_text().unwrap()).unwrap();
        assert_eq!(sent["content"], "summarise\nfile://uploads/42");
        assert!(sent["local_id"].as_str().unwrap().starts_with("loc_"));
    }
}
