use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::bus::{ExtensionMessage, MessageBus, OAuthCallback};
use crate::error::Error;
use crate::types::CallbackState;

/// Correlation table of in-flight login attempts, keyed by `state` nonce.
///
/// A callback is delivered to at most one attempt, and only to the one whose
/// nonce it carries. Anything else is inert.
#[derive(Debug, Default)]
pub struct CallbackRouter {
    pending: Mutex<HashMap<CallbackState, oneshot::Sender<OAuthCallback>>>,
}

impl CallbackRouter {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `state` and get a handle that resolves with its callback.
    ///
    /// The entry is removed when the callback is routed or the handle is dropped.
    #[must_use]
    pub fn register(self: &Arc<Self>, state: CallbackState) -> PendingCallback {
        let (tx, rx) = oneshot::channel();
        let previous = self.lock().insert(state.clone(), tx);
        if previous.is_some() {
            tracing::warn!("Replaced pending login attempt with duplicate state");
        }
        PendingCallback {
            state,
            rx,
            router: Arc::clone(self),
        }
    }

    /// Deliver a callback to the attempt that owns its `state`.
    ///
    /// Returns `false` when no live attempt matched.
    pub fn route(&self, callback: OAuthCallback) -> bool {
        let Some(state) = callback.state.clone() else {
            tracing::warn!("Ignoring OAuth callback without state");
            return false;
        };

        let Some(tx) = self.lock().remove(&state) else {
            tracing::warn!("Ignoring OAuth callback for unknown or expired state");
            return false;
        };

        tx.send(callback).is_ok()
    }

    /// Abort the attempt waiting on `state`, e.g. when the host saw its popup
    /// closed by the user. That attempt's wait fails with [`Error::CallbackDropped`].
    pub fn cancel(&self, state: &CallbackState) -> bool {
        self.lock().remove(state).is_some()
    }

    /// Number of attempts still waiting for a callback.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Route every `oauth-callback` published on `bus` until the bus closes.
    pub fn spawn(self: &Arc<Self>, bus: &MessageBus) -> JoinHandle<()> {
        let router = Arc::clone(self);
        let rx = bus.subscribe();
        tokio::spawn(async move { router.listen(rx).await })
    }

    async fn listen(&self, mut rx: broadcast::Receiver<ExtensionMessage>) {
        loop {
            match rx.recv().await {
                Ok(ExtensionMessage::OAuthCallback(callback)) => {
                    self.route(callback);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Callback router lagged behind message bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CallbackState, oneshot::Sender<OAuthCallback>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One attempt's registration in the [`CallbackRouter`].
#[derive(Debug)]
pub struct PendingCallback {
    state: CallbackState,
    rx: oneshot::Receiver<OAuthCallback>,
    router: Arc<CallbackRouter>,
}

impl PendingCallback {
    /// Wait for the matching callback, at most `timeout`.
    ///
    /// # Errors
    ///
    /// [`Error::CallbackTimeout`] when nothing arrived in time,
    /// [`Error::CallbackDropped`] if the attempt was cancelled through the router.
    pub async fn wait(mut self, timeout: Duration) -> Result<OAuthCallback, Error> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(callback)) => Ok(callback),
            Ok(Err(_)) => Err(Error::CallbackDropped),
            Err(_) => Err(Error::CallbackTimeout),
        }
    }
}

impl Drop for PendingCallback {
    fn drop(&mut self) {
        self.router.cancel(&self.state);
    }
}
