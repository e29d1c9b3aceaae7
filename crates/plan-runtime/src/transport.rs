//! Delivery of the terminal event to the requester.
//!
//! Only the reply enforcer calls a [`Transport`], exactly once per run.

use crate::executor::{ReplyStatus, VerificationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// The terminal event of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub requester: String,
    pub run_id: String,
    pub message: String,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<VerificationResult>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Transport closed")]
    Closed,
}

/// Sends the terminal message of a run to whoever asked for it (web socket, chat
/// channel, CLI, ...).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, event: TerminalEvent) -> Result<(), TransportError>;
}

/// In-process transport backed by an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<TerminalEvent>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, event: TerminalEvent) -> Result<(), TransportError> {
        self.tx.send(event).map_err(|_| TransportError::Closed)
    }
}
