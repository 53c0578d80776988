//! Owner of the single live transport.
//!
//! ```text
//! Closed -> Connecting -> Open -> Closed
//!                          |
//!                          +-- unexpected close --> Reconnecting{n} -> Open
//!                                                        |
//!                                                        +-- exhausted --> Closed
//! ```
//!
//! Every link gets a fresh generation number. Frames, close notices and
//! retry timers carry the generation they were created for, so anything
//! belonging to a replaced link is recognised and dropped.

use std::sync::Arc;
use std::time::Duration;

use parley_config::ReconnectPolicy;
use parley_types::OutboundPayload;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{require_token, TokenSource};
use crate::error::ClientError;
use crate::event::{ChannelEvent, ChannelEventKind, EngineEvent};
use crate::transport::{is_auth_close, Connector, InboundFrame, OutboundFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Connecting,
    Open,
    Reconnecting { attempt: u32 },
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "closed"),
            ChannelState::Connecting => write!(f, "connecting"),
            ChannelState::Open => write!(f, "open"),
            ChannelState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Stale or expected close.
    Ignored,
    Reconnecting { attempt: u32, delay: Duration },
    AuthRejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Ignored,
    Connected,
    Scheduled { attempt: u32, delay: Duration },
    Exhausted { attempts: u32 },
    AuthRejected,
}

/// `base * 2^(attempt - 1)`, capped at `max_delay`.
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    policy
        .base_delay
        .saturating_mul(1u32 << exponent)
        .min(policy.max_delay)
}

/// `{ws_url}/ws?token=..&chat_id=..`
pub fn transport_url(ws_url: &str, token: &str, session_id: &str) -> Result<Url, ClientError> {
    let mut url = Url::parse(&format!("{}/ws", ws_url.trim_end_matches('/')))
        .map_err(|err| ClientError::Connect(format!("invalid transport url: {}", err)))?;
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("chat_id", session_id);
    Ok(url)
}

#[derive(Debug, thiserror::Error)]
#[error("Sleep cancelled")]
struct SleepCancelled;

async fn sleep_with_cancel(duration: Duration, cancel: CancellationToken) -> Result<(), SleepCancelled> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancel.cancelled() => Err(SleepCancelled),
    }
}

struct Link {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
}

impl Link {
    fn shutdown(self, graceful: bool) {
        if graceful {
            let _ = self.outbound.send(OutboundFrame::Close);
        }
        self.cancel.cancel();
    }
}

pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenSource>,
    ws_url: String,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: ChannelState,
    session_id: Option<String>,
    generation: u64,
    link: Option<Link>,
    retry_cancel: Option<CancellationToken>,
}

impl ChannelManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenSource>,
        ws_url: impl Into<String>,
        policy: ReconnectPolicy,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            connector,
            tokens,
            ws_url: ws_url.into(),
            policy,
            events,
            state: ChannelState::Closed,
            session_id: None,
            generation: 0,
            link: None,
            retry_cancel: None,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when `generation` belongs to the live link.
    pub fn is_current(&self, generation: u64) -> bool {
        self.link.is_some() && generation == self.generation
    }

    /// Open a transport for `session_id`, closing any previous one first.
    pub async fn connect(&mut self, session_id: &str) -> Result<(), ClientError> {
        let token = require_token(self.tokens.as_ref())?;
        self.close();
        self.session_id = Some(session_id.to_string());
        self.open(&token).await
    }

    async fn open(&mut self, token: &str) -> Result<(), ClientError> {
        let session_id = self.session_id.clone().ok_or(ClientError::NoActiveSession)?;
        let url = transport_url(&self.ws_url, token, &session_id)?;

        self.generation += 1;
        let generation = self.generation;
        let reconnecting = matches!(self.state, ChannelState::Reconnecting { .. });
        if !reconnecting {
            self.state = ChannelState::Connecting;
        }

        tracing::debug!(session_id = %session_id, generation, "opening transport");
        match self.connector.connect(&url).await {
            Ok(handle) => {
                let cancel = CancellationToken::new();
                self.spawn_forwarder(generation, session_id.clone(), handle.inbound, cancel.clone());
                self.link = Some(Link {
                    outbound: handle.outbound,
                    cancel,
                });
                self.state = ChannelState::Open;
                tracing::info!(session_id = %session_id, generation, "transport open");
                Ok(())
            }
            Err(err) => {
                if !reconnecting {
                    self.state = ChannelState::Closed;
                }
                tracing::warn!(session_id = %session_id, %err, "transport connect failed");
                Err(err)
            }
        }
    }

    fn spawn_forwarder(
        &self,
        generation: u64,
        session_id: String,
        mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
        cancel: CancellationToken,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    frame = inbound.recv() => frame,
                };
                let kind = match frame {
                    Some(InboundFrame::Text(text)) => ChannelEventKind::Frame(text),
                    Some(InboundFrame::Closed { code, reason }) => {
                        ChannelEventKind::Closed { code, reason }
                    }
                    None => ChannelEventKind::Closed {
                        code: None,
                        reason: None,
                    },
                };
                let last = matches!(kind, ChannelEventKind::Closed { .. });
                let event = EngineEvent::Channel(ChannelEvent {
                    generation,
                    session_id: session_id.clone(),
                    kind,
                });
                if events.send(event).is_err() || last {
                    return;
                }
            }
        });
    }

    /// Fire-and-forget send on the open transport.
    pub fn send(&self, payload: &OutboundPayload) -> Result<(), ClientError> {
        if self.state != ChannelState::Open {
            return Err(ClientError::NotConnected);
        }
        let link = self.link.as_ref().ok_or(ClientError::NotConnected)?;
        link.outbound
            .send(OutboundFrame::Text(payload.to_json()))
            .map_err(|_| ClientError::NotConnected)
    }

    /// User-initiated close. Never triggers a reconnect.
    pub fn close(&mut self) {
        if let Some(cancel) = self.retry_cancel.take() {
            cancel.cancel();
        }
        if let Some(link) = self.link.take() {
            tracing::debug!(session_id = ?self.session_id, generation = self.generation, "closing transport");
            link.shutdown(true);
        }
        self.generation += 1;
        self.state = ChannelState::Closed;
    }

    /// The transport of `generation` went away without being asked to.
    pub fn on_closed(&mut self, generation: u64, code: Option<u16>) -> CloseOutcome {
        if !self.is_current(generation) || self.state != ChannelState::Open {
            return CloseOutcome::Ignored;
        }
        if let Some(link) = self.link.take() {
            link.shutdown(false);
        }

        if is_auth_close(code) {
            tracing::warn!(session_id = ?self.session_id, ?code, "transport rejected credentials");
            self.state = ChannelState::Closed;
            return CloseOutcome::AuthRejected;
        }

        let (attempt, delay) = self.schedule(1);
        CloseOutcome::Reconnecting { attempt, delay }
    }

    /// A backoff timer fired.
    pub async fn retry(&mut self, generation: u64, attempt: u32) -> RetryOutcome {
        if generation != self.generation || self.state != (ChannelState::Reconnecting { attempt }) {
            return RetryOutcome::Ignored;
        }
        self.retry_cancel = None;

        let token = match require_token(self.tokens.as_ref()) {
            Ok(token) => token,
            Err(_) => {
                self.state = ChannelState::Closed;
                return RetryOutcome::AuthRejected;
            }
        };

        match self.open(&token).await {
            Ok(()) => RetryOutcome::Connected,
            Err(ClientError::Auth(_)) => {
                self.state = ChannelState::Closed;
                RetryOutcome::AuthRejected
            }
            Err(_) if attempt >= self.policy.max_attempts => {
                tracing::warn!(session_id = ?self.session_id, attempts = attempt, "reconnect attempts exhausted");
                self.state = ChannelState::Closed;
                RetryOutcome::Exhausted { attempts: attempt }
            }
            Err(_) => {
                let (attempt, delay) = self.schedule(attempt + 1);
                RetryOutcome::Scheduled { attempt, delay }
            }
        }
    }

    fn schedule(&mut self, attempt: u32) -> (u32, Duration) {
        let delay = backoff_delay(&self.policy, attempt);
        self.state = ChannelState::Reconnecting { attempt };

        let cancel = CancellationToken::new();
        self.retry_cancel = Some(cancel.clone());
        let events = self.events.clone();
        let generation = self.generation;
        tracing::info!(
            session_id = ?self.session_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        tokio::spawn(async move {
            if sleep_with_cancel(delay, cancel).await.is_ok() {
                let _ = events.send(EngineEvent::ReconnectDue { generation, attempt });
            }
        });
        (attempt, delay)
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;
    use crate::transport::MemoryConnector;

    fn slow_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            max_attempts,
        }
    }

    fn manager(
        connector: Arc<MemoryConnector>,
        token: Option<&str>,
        max_attempts: u32,
    ) -> (ChannelManager, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = ChannelManager::new(
            connector,
            Arc::new(StaticToken::new(token.map(str::to_string))),
            "ws://localhost:8000/api/chat/",
            slow_policy(max_attempts),
            tx,
        );
        (channel, rx)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 5,
        };
        let delays: Vec<u128> = (1..=6)
            .map(|n| backoff_delay(&policy, n).as_millis())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
        assert_eq!(backoff_delay(&policy, 200), policy.max_delay);
    }

    #[test]
    fn transport_url_carries_token_and_session() {
        let url = transport_url("ws://host/api/chat/", "a b", "42").unwrap();
        assert_eq!(url.as_str(), "ws://host/api/chat/ws?token=a+b&chat_id=42");
    }

    #[tokio::test]
    async fn connect_without_token_is_auth_error() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector.clone(), None, 3);

        let err = channel.connect("s1").await.unwrap_err();
        assert!(err.is_auth());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn send_requires_open_transport() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector.clone(), Some("tok"), 3);
        let payload = OutboundPayload::new("hi");
        assert!(matches!(channel.send(&payload), Err(ClientError::NotConnected)));

        channel.connect("s1").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
        channel.send(&payload).unwrap();

        let mut peer = connector.take_peer().unwrap();
        assert_eq!(peer.query("chat_id").as_deref(), Some("s1"));
        assert_eq!(peer.try_recv_text().unwrap(), payload.to_json());
    }

    #[tokio::test]
    async fn connect_failure_is_connect_error() {
        let connector = Arc::new(MemoryConnector::new());
        connector.refuse_next(1);
        let (mut channel, _rx) = manager(connector, Some("tok"), 3);

        let err = channel.connect("s1").await.unwrap_err();
        assert!(matches!(err, ClientError::Connect(_)));
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn reconnecting_to_another_session_closes_the_old_link() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector.clone(), Some("tok"), 3);

        channel.connect("s1").await.unwrap();
        let old_generation = channel.generation();
        channel.connect("s2").await.unwrap();

        let mut first = connector.take_peer().unwrap();
        assert!(first.client_closed());
        assert!(!channel.is_current(old_generation));
        assert_eq!(channel.session_id(), Some("s2"));
        assert_eq!(
            channel.on_closed(old_generation, None),
            CloseOutcome::Ignored
        );
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn frames_are_forwarded_with_generation() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, mut rx) = manager(connector.clone(), Some("tok"), 3);
        channel.connect("s1").await.unwrap();
        let peer = connector.take_peer().unwrap();

        peer.send_text("{}");
        peer.drop_connection();

        let Some(EngineEvent::Channel(frame)) = rx.recv().await else {
            panic!("expected frame");
        };
        assert_eq!(frame.generation, channel.generation());
        assert_eq!(frame.kind, ChannelEventKind::Frame("{}".into()));

        let Some(EngineEvent::Channel(closed)) = rx.recv().await else {
            panic!("expected close");
        };
        assert_eq!(
            closed.kind,
            ChannelEventKind::Closed {
                code: Some(1006),
                reason: None
            }
        );
    }

    #[tokio::test]
    async fn user_close_never_reconnects() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector, Some("tok"), 3);
        channel.connect("s1").await.unwrap();
        let generation = channel.generation();

        channel.close();
        assert_eq!(channel.on_closed(generation, None), CloseOutcome::Ignored);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn unexpected_close_backs_off_until_exhausted() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector.clone(), Some("tok"), 2);
        channel.connect("s1").await.unwrap();

        let outcome = channel.on_closed(channel.generation(), Some(1006));
        assert_eq!(
            outcome,
            CloseOutcome::Reconnecting {
                attempt: 1,
                delay: Duration::from_secs(60)
            }
        );
        assert_eq!(channel.state(), ChannelState::Reconnecting { attempt: 1 });
        assert!(matches!(
            channel.send(&OutboundPayload::new("x")),
            Err(ClientError::NotConnected)
        ));

        connector.refuse_next(2);
        let outcome = channel.retry(channel.generation(), 1).await;
        assert_eq!(
            outcome,
            RetryOutcome::Scheduled {
                attempt: 2,
                delay: Duration::from_secs(120)
            }
        );
        assert_eq!(channel.retry(channel.generation(), 1).await, RetryOutcome::Ignored);

        let outcome = channel.retry(channel.generation(), 2).await;
        assert_eq!(outcome, RetryOutcome::Exhausted { attempts: 2 });
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.connect("s1").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn retry_restores_open_state() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector.clone(), Some("tok"), 5);
        channel.connect("s1").await.unwrap();
        channel.on_closed(channel.generation(), None);

        assert_eq!(channel.retry(channel.generation(), 1).await, RetryOutcome::Connected);
        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn auth_close_code_stops_reconnects() {
        let connector = Arc::new(MemoryConnector::new());
        let (mut channel, _rx) = manager(connector, Some("tok"), 5);
        channel.connect("s1").await.unwrap();

        assert_eq!(
            channel.on_closed(channel.generation(), Some(4001)),
            CloseOutcome::AuthRejected
        );
        assert_eq!(channel.state(), ChannelState::Closed);
    }
}
