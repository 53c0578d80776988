use std::sync::Arc;

use parley_config::ClientSettings;

use crate::api::{ChatApi, HttpChatApi};
use crate::auth::TokenSource;
use crate::error::ClientError;
use crate::render::RenderSink;
use crate::transport::{Connector, WebSocketConnector};

/// Collaborators the engine is built from. Constructed once at startup and
/// handed to [`crate::ChatEngine::new`].
#[derive(Clone)]
pub struct ClientContext {
    pub settings: ClientSettings,
    pub api: Arc<dyn ChatApi>,
    pub tokens: Arc<dyn TokenSource>,
    pub connector: Arc<dyn Connector>,
    pub render: Arc<dyn RenderSink>,
}

impl ClientContext {
    pub fn new(
        settings: ClientSettings,
        api: Arc<dyn ChatApi>,
        tokens: Arc<dyn TokenSource>,
        connector: Arc<dyn Connector>,
        render: Arc<dyn RenderSink>,
    ) -> Self {
        Self {
            settings,
            api,
            tokens,
            connector,
            render,
        }
    }

    /// REST over `reqwest`, live transport over WebSocket.
    pub fn connect_http(
        settings: ClientSettings,
        tokens: Arc<dyn TokenSource>,
        render: Arc<dyn RenderSink>,
    ) -> Result<Self, ClientError> {
        let api = HttpChatApi::new(&settings, tokens.clone())?;
        Ok(Self::new(
            settings,
            Arc::new(api),
            tokens,
            Arc::new(WebSocketConnector::new()),
            render,
        ))
    }
}
