use std::future::Future;

use tokio::sync::mpsc;
use url::Url;

use crate::bus::{ExtensionMessage, MessageBus, OAuthCallback};
use crate::types::{CallbackState, TabId};

/// A navigation the browser is about to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationEvent {
    pub tab_id: TabId,
    pub url: String,
}

/// What the interceptor did with a navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    /// Not the redirect URL; let it proceed.
    Ignored,
    /// Redirect captured; the tab was asked to close and the navigation must not load.
    Intercepted,
}

/// Host capability that closes browser tabs.
pub trait TabHost: Send + Sync + 'static {
    fn remove_tab(
        &self,
        tab_id: TabId,
    ) -> impl Future<Output = Result<(), Box<dyn std::error::Error + Send + Sync>>> + Send;
}

/// Watches navigations in the background context for the OAuth redirect.
///
/// This is the only path by which an authorization code leaves the popup.
pub struct NavigationInterceptor<T> {
    redirect_prefix: String,
    bus: MessageBus,
    tabs: T,
}

impl<T: TabHost> NavigationInterceptor<T> {
    /// Intercept navigations whose URL starts with `redirect_uri` exactly.
    #[must_use]
    pub fn new(redirect_uri: &Url, bus: MessageBus, tabs: T) -> Self {
        Self {
            redirect_prefix: redirect_uri.as_str().to_string(),
            bus,
            tabs,
        }
    }

    /// Handle one navigation attempt.
    pub async fn on_before_navigate(&self, event: &NavigationEvent) -> NavigationOutcome {
        if !event.url.starts_with(&self.redirect_prefix) {
            return NavigationOutcome::Ignored;
        }

        let callback = parse_callback(&event.url);
        tracing::debug!(
            tab_id = %event.tab_id,
            has_code = callback.code.is_some(),
            has_error = callback.error.is_some(),
            "Intercepted OAuth redirect"
        );

        if self
            .bus
            .publish(ExtensionMessage::OAuthCallback(callback))
            .is_err()
        {
            tracing::warn!(tab_id = %event.tab_id, "Could not deliver OAuth callback: no listener");
        }

        if let Err(e) = self.tabs.remove_tab(event.tab_id).await {
            tracing::warn!(tab_id = %event.tab_id, error = %e, "Could not close OAuth callback tab");
        }

        NavigationOutcome::Intercepted
    }

    /// Process navigation events until every sender is dropped.
    pub async fn run(&self, mut events: mpsc::Receiver<NavigationEvent>) {
        while let Some(event) = events.recv().await {
            self.on_before_navigate(&event).await;
        }
    }
}

/// Pull `code`, `state` and `error` out of a redirect URL (first occurrence wins).
fn parse_callback(raw: &str) -> OAuthCallback {
    let Ok(url) = Url::parse(raw) else {
        return OAuthCallback::default();
    };

    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    OAuthCallback {
        code: param("code"),
        state: param("state").map(CallbackState),
        error: param("error"),
    }
}
