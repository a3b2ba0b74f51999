//! Scripted Transport
//!
//! In-process `Transport` for tests and offline runs. Each `open()` call
//! consumes the next scripted outcome (accepting by default) and records when
//! it happened. Accepted links are handed to the test as [`MockServer`]s
//! that push frames to the client and read what the client sent.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::application::ports::{Transport, TransportError, TransportLink};

/// Scripted result of one `open()` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Open a link.
    Accept,
    /// Fail with a connect error.
    Fail(String),
}

#[derive(Debug, Default)]
struct Script {
    outcomes: VecDeque<OpenOutcome>,
    fail_by_default: bool,
    auth_ack: bool,
    opens: Vec<Instant>,
}

/// Scripted transport.
#[derive(Clone)]
pub struct MockTransport {
    endpoint: String,
    script: Arc<Mutex<Script>>,
    servers_tx: mpsc::UnboundedSender<MockServer>,
    servers_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockServer>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("endpoint", &self.endpoint)
            .field("opens", &self.open_count())
            .finish_non_exhaustive()
    }
}

impl MockTransport {
    /// Create a transport that accepts every open.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        Self {
            endpoint: endpoint.into(),
            script: Arc::new(Mutex::new(Script::default())),
            servers_tx,
            servers_rx: Arc::new(tokio::sync::Mutex::new(servers_rx)),
        }
    }

    /// Queue outcomes for the next `open()` calls.
    pub fn script(&self, outcomes: impl IntoIterator<Item = OpenOutcome>) {
        self.script.lock().outcomes.extend(outcomes);
    }

    /// Outcome used once the script is exhausted.
    pub fn fail_by_default(&self, fail: bool) {
        self.script.lock().fail_by_default = fail;
    }

    /// Acknowledge authentication as soon as a link opens.
    pub fn acknowledge_auth(&self, ack: bool) {
        self.script.lock().auth_ack = ack;
    }

    /// Number of `open()` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.script.lock().opens.len()
    }

    /// When each `open()` call happened.
    #[must_use]
    pub fn open_instants(&self) -> Vec<Instant> {
        self.script.lock().opens.clone()
    }

    /// Wait for the next accepted link. `None` once no link can arrive.
    pub async fn server(&self) -> Option<MockServer> {
        self.servers_rx.lock().await.recv().await
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self) -> Result<TransportLink, TransportError> {
        let (outcome, auth_ack) = {
            let mut script = self.script.lock();
            script.opens.push(Instant::now());
            let outcome = script.outcomes.pop_front().unwrap_or(if script.fail_by_default {
                OpenOutcome::Fail("scripted failure".to_string())
            } else {
                OpenOutcome::Accept
            });
            (outcome, script.auth_ack)
        };

        match outcome {
            OpenOutcome::Fail(reason) => Err(TransportError::Connect(reason)),
            OpenOutcome::Accept => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (inbound_tx, inbound_rx) = mpsc::channel(256);

                let server = MockServer {
                    to_client: inbound_tx,
                    from_client: outbound_rx,
                };
                if auth_ack {
                    server.push_text(
                        r#"{"type":"connection_status","data":{"status":"authenticated"}}"#,
                    );
                }
                let _ = self.servers_tx.send(server);

                Ok(TransportLink {
                    outbound: outbound_tx,
                    inbound: inbound_rx,
                })
            }
        }
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Server side of one accepted link. Dropping it closes the link.
#[derive(Debug)]
pub struct MockServer {
    to_client: mpsc::Sender<Result<String, TransportError>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    /// Push a text frame to the client.
    pub fn push_text(&self, text: &str) {
        let _ = self.to_client.try_send(Ok(text.to_string()));
    }

    /// Push a JSON envelope to the client.
    pub fn push_json(&self, value: &Value) {
        self.push_text(&value.to_string());
    }

    /// Push a read error to the client.
    pub fn push_error(&self, error: TransportError) {
        let _ = self.to_client.try_send(Err(error));
    }

    /// Next frame the client sent, parsed as JSON. `None` once the client dropped its side.
    pub async fn next_sent(&mut self) -> Option<Value> {
        loop {
            let text = self.from_client.recv().await?;
            if let Ok(value) = serde_json::from_str(&text) {
                return Some(value);
            }
        }
    }

    /// Next non-`ping` frame the client sent.
    pub async fn next_control(&mut self) -> Option<Value> {
        loop {
            let value = self.next_sent().await?;
            if value["type"] != "ping" {
                return Some(value);
            }
        }
    }

    /// Frames already sent by the client, without waiting.
    pub fn drain_sent(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(value) = serde_json::from_str(&text) {
                frames.push(value);
            }
        }
        frames
    }

    /// Close the link from the server side.
    pub fn close(self) {
        drop(self);
    }
}
