//! WebSocket Transport
//!
//! `Transport` adapter over `tokio-tungstenite`. Each opened link runs a
//! reader task and a writer task bridging the socket to mpsc channels.
//!
//! # Protocol
//!
//! Text frames carry JSON envelopes. Binary frames are accepted when they
//! hold UTF-8 text. Protocol-level pings are answered by tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::application::ports::{Transport, TransportError, TransportLink};

/// Inbound channel capacity per link.
const INBOUND_CAPACITY: usize = 1024;

/// WebSocket transport for a fixed endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    /// Create a transport for `url` (`ws://` or `wss://`).
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        tracing::debug!(url = %self.url, "Opening WebSocket");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

        let writer_inbound = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    tracing::warn!(error = %e, "WebSocket write failed");
                    let _ = writer_inbound
                        .send(Err(TransportError::Send(e.to_string())))
                        .await;
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            tracing::debug!("WebSocket writer closed");
        });

        tokio::spawn(async move {
            while let Some(message) = read.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => Ok(text.as_str().to_owned()),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => Ok(text),
                        Err(_) => {
                            tracing::debug!("Ignoring non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::info!(frame = ?frame, "Server sent close frame");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => Err(TransportError::Receive(e.to_string())),
                };

                let failed = frame.is_err();
                if inbound_tx.send(frame).await.is_err() || failed {
                    break;
                }
            }
            tracing::debug!("WebSocket reader closed");
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_reported() {
        let transport = WebSocketTransport::new("wss://feed.example.com/stream");
        assert_eq!(transport.endpoint(), "wss://feed.example.com/stream");
    }

    #[tokio::test]
    async fn open_fails_for_unreachable_endpoint() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/stream");
        let result = transport.open().await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }
}
