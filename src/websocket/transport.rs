//! Seam between the connection manager and the push transport

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

use super::HubCommand;

/// Lifecycle and inbound traffic reported by a live link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Server invoked a client method
    Invocation { target: String, arguments: Vec<Value> },
    /// Socket dropped; the transport is retrying
    Reconnecting { reason: String },
    /// A retry succeeded and the handshake completed
    Reconnected,
    /// The link is gone for good. `None` means it was stopped on request.
    Closed { error: Option<String> },
}

/// An established hub connection
#[async_trait]
pub trait HubLink: Send + Sync {
    /// Invoke a hub method and wait for its completion
    async fn invoke(&self, command: HubCommand) -> Result<()>;

    /// Close the link. Safe to call more than once.
    async fn stop(&self);
}

/// A started link plus the stream of its events
pub struct LinkHandle {
    pub link: Arc<dyn HubLink>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Opens hub connections. Resolves once the handshake has completed.
#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<LinkHandle>;
}
