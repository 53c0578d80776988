//! Live transport seam.
//!
//! A [`Connector`] turns a session-scoped URL into a pair of frame channels.
//! The channel manager only ever sees frames, never the socket itself.

mod memory;
mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::ClientError;

pub use memory::{MemoryConnector, MemoryPeer};
pub use websocket::WebSocketConnector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    /// Graceful close requested by the client.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    /// The peer went away. `code` is the close code when one was sent.
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Resolve once the transport is open.
    async fn connect(&self, url: &Url) -> Result<TransportHandle, ClientError>;
}

/// Close codes the backend uses for rejected credentials.
pub fn is_auth_close(code: Option<u16>) -> bool {
    matches!(code, Some(1008 | 4001 | 4003))
}
