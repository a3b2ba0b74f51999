//! Transport Port (Driven Port)
//!
//! Interface for opening a bidirectional text-frame link to the upstream feed.
//! The WebSocket adapter and the scripted test transport implement it.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Transport error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Link could not be established.
    #[error("Transport connect failed: {0}")]
    Connect(String),

    /// Outbound frame could not be written.
    #[error("Transport send failed: {0}")]
    Send(String),

    /// Inbound read failed.
    #[error("Transport receive failed: {0}")]
    Receive(String),

    /// Link closed by the peer.
    #[error("Transport closed")]
    Closed,
}

/// An open link.
///
/// Frames written to `outbound` are sent in order. `inbound` yields received
/// text frames; it closes when the link closes.
#[derive(Debug)]
pub struct TransportLink {
    /// Outbound text frames.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Inbound text frames or read errors.
    pub inbound: mpsc::Receiver<Result<String, TransportError>>,
}

/// Port for opening the upstream link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new link.
    async fn open(&self) -> Result<TransportLink, TransportError>;

    /// Endpoint this transport connects to.
    fn endpoint(&self) -> &str;
}
