use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::CallbackState;

const BUS_CAPACITY: usize = 16;

/// Redirect parameters relayed from the background context.
///
/// Any field may be absent; only `state` decides which attempt consumes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCallback {
    pub code: Option<String>,
    pub state: Option<CallbackState>,
    pub error: Option<String>,
}

/// Messages exchanged between the extension contexts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum ExtensionMessage {
    #[serde(rename = "oauth-callback")]
    OAuthCallback(OAuthCallback),
}

/// Broadcast channel standing in for the extension runtime's message passing.
///
/// Delivery is fire-and-forget: every live subscriber sees every message, and
/// a publish with no subscriber is dropped.
#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<ExtensionMessage>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionMessage> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. Returns how many received it.
    ///
    /// # Errors
    ///
    /// Returns the message back if nobody is listening.
    pub fn publish(&self, message: ExtensionMessage) -> Result<usize, ExtensionMessage> {
        self.tx.send(message).map_err(|e| e.0)
    }
}
