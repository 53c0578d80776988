use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};
use url::Url;

use super::{Connector, InboundFrame, OutboundFrame, TransportHandle};
use crate::error::ClientError;

/// In-process transport. Every successful connect yields a [`MemoryPeer`]
/// holding the server side of the link.
#[derive(Debug, Default)]
pub struct MemoryConnector {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    refuse_next: u32,
    attempts: u32,
    peers: VecDeque<MemoryPeer>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` connects fail with a connect error.
    pub fn refuse_next(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.refuse_next = count;
        }
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().map(|s| s.attempts).unwrap_or_default()
    }

    /// Oldest link not yet taken.
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.state.lock().ok().and_then(|mut s| s.peers.pop_front())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<TransportHandle, ClientError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ClientError::Connect("memory transport poisoned".into()))?;
        state.attempts += 1;
        if state.refuse_next > 0 {
            state.refuse_next -= 1;
            return Err(ClientError::Connect("connection refused".into()));
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        state.peers.push_back(MemoryPeer {
            url: url.clone(),
            from_client: outbound_rx,
            to_client: inbound_tx,
        });

        Ok(TransportHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[derive(Debug)]
pub struct MemoryPeer {
    pub url: Url,
    from_client: mpsc::UnboundedReceiver<OutboundFrame>,
    to_client: mpsc::UnboundedSender<InboundFrame>,
}

impl MemoryPeer {
    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(InboundFrame::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    /// Drop the link without a close handshake.
    pub fn drop_connection(self) {
        let _ = self.to_client.send(InboundFrame::Closed {
            code: Some(1006),
            reason: None,
        });
    }

    pub fn close_with(self, code: u16, reason: &str) {
        let _ = self.to_client.send(InboundFrame::Closed {
            code: Some(code),
            reason: Some(reason.to_string()),
        });
    }

    /// Next text frame the client sent, if any is queued.
    pub fn try_recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_client.try_recv() {
                Ok(OutboundFrame::Text(text)) => return Some(text),
                Ok(OutboundFrame::Close) => continue,
                Err(_) => return None,
            }
        }
    }

    /// True once the client asked to close or dropped its sender.
    pub fn client_closed(&mut self) -> bool {
        loop {
            match self.from_client.try_recv() {
                Ok(OutboundFrame::Close) | Err(TryRecvError::Disconnected) => return true,
                Ok(OutboundFrame::Text(_)) => continue,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }
}
