use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::connect_async;
use url::Url;

use super::{Connector, InboundFrame, OutboundFrame, TransportHandle};
use crate::error::ClientError;

/// WebSocket transport backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<TransportHandle, ClientError> {
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| match err {
            tungstenite::Error::Http(response)
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                ClientError::Auth(format!("handshake rejected: {}", response.status()))
            }
            other => ClientError::Connect(other.to_string()),
        })?;

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<WsMessage>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(OutboundFrame::Text(text)) => {
                                if let Err(err) = write.send(WsMessage::Text(text.into())).await {
                                    tracing::debug!(%err, "websocket write failed");
                                    break;
                                }
                            }
                            Some(OutboundFrame::Close) | None => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                break;
                            }
                        }
                    }
                    Some(pong) = pong_rx.recv() => {
                        if write.send(pong).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        tokio::spawn(async move {
            let closed = loop {
                let msg = match read.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(err)) => {
                        break InboundFrame::Closed {
                            code: None,
                            reason: Some(err.to_string()),
                        };
                    }
                    None => {
                        break InboundFrame::Closed {
                            code: None,
                            reason: None,
                        };
                    }
                };

                match msg {
                    WsMessage::Text(t) => {
                        if inbound_tx.send(InboundFrame::Text(t.to_string())).is_err() {
                            return;
                        }
                    }
                    WsMessage::Ping(data) => {
                        let _ = pong_tx.send(WsMessage::Pong(data));
                    }
                    WsMessage::Close(frame) => {
                        break InboundFrame::Closed {
                            code: frame.as_ref().map(|f| u16::from(f.code)),
                            reason: frame
                                .map(|f| f.reason.to_string())
                                .filter(|reason| !reason.is_empty()),
                        };
                    }
                    _ => {}
                }
            };
            let _ = inbound_tx.send(closed);
        });

        Ok(TransportHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
