use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, watch};

use crate::authorize::AuthorizationRequest;
use crate::callback::CallbackRouter;
use crate::config::AuthConfig;
use crate::discovery::OidcResolver;
use crate::error::Error;
use crate::exchange::{Sleeper, TokenExchangeClient, TokioSleeper, UserProfile};
use crate::popup::{self, PopupHost, PopupWindow};
use crate::storage::KeyValueStore;
use crate::types::UserId;

/// Storage key of the persisted session record.
pub const STORAGE_KEY: &str = "auth-storage";

const STORAGE_VERSION: u32 = 0;

/// Reporting id used while signed out.
pub const ANONYMOUS_REPORTING_ID: &str = "0";

/// Reporting email used while signed out.
pub const ANONYMOUS_REPORTING_EMAIL: &str = "anonymous@ciwebgroup.com";

/// Authentication state shared with every panel of the companion.
///
/// `is_authenticated` implies `user` is present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
#[non_exhaustive]
pub struct Session {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub user: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub authenticated_at: Option<OffsetDateTime>,
}

/// Coarse login state derived from a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Anonymous,
    Authenticating,
    Authenticated,
}

/// Identity attached to reports sent by background collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportingIdentity {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Session {
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if self.is_loading {
            SessionPhase::Authenticating
        } else if self.is_authenticated {
            SessionPhase::Authenticated
        } else {
            SessionPhase::Anonymous
        }
    }

    /// Who background reports are attributed to; a fixed anonymous
    /// placeholder when signed out.
    #[must_use]
    pub fn reporting_identity(&self) -> ReportingIdentity {
        match (&self.user, self.is_authenticated) {
            (Some(user), true) => ReportingIdentity {
                id: user.to_string(),
                email: self.email.clone(),
                name: self.name.clone(),
            },
            _ => ReportingIdentity {
                id: ANONYMOUS_REPORTING_ID.into(),
                email: Some(ANONYMOUS_REPORTING_EMAIL.into()),
                name: None,
            },
        }
    }

    fn sign_in(&mut self, profile: UserProfile) {
        self.is_authenticated = true;
        self.user = Some(profile.user);
        self.email = profile.email;
        self.name = profile.name;
        self.user_image = profile.picture;
        self.authenticated_at = Some(OffsetDateTime::now_utc());
    }

    fn sign_out(&mut self) {
        *self = Self {
            is_loading: self.is_loading,
            ..Self::default()
        };
    }

    /// Drop anything a restarted process must not trust.
    fn sanitized(mut self) -> Self {
        self.is_loading = false;
        if self.is_authenticated && self.user.is_none() {
            tracing::warn!("Persisted session claimed authentication without a user; resetting");
            self.sign_out();
        }
        self
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedSession {
    state: Session,
    version: u32,
}

/// Consumer-provided password check for the non-SSO login path.
pub trait CredentialVerifier: Send + Sync + 'static {
    /// `Ok(true)` accepts the credentials; `Ok(false)` or an error rejects them.
    fn verify(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<bool, Box<dyn std::error::Error + Send + Sync>>> + Send;
}

struct SessionInner {
    session: Session,
    in_flight: usize,
}

/// Sole owner of authentication state.
///
/// Mutations go through [`login`](Self::login), [`logout`](Self::logout) and
/// [`login_with_sso`](Self::login_with_sso), are serialized by an internal lock,
/// and are written to storage before the lock is released.
///
/// Concurrent `login_with_sso` calls are allowed; each waits only for the
/// callback carrying its own `state`.
pub struct SessionStore<K, P, C, S = TokioSleeper> {
    config: AuthConfig,
    storage: K,
    popups: P,
    credentials: C,
    resolver: OidcResolver,
    exchange: TokenExchangeClient<S>,
    router: Arc<CallbackRouter>,
    inner: Mutex<SessionInner>,
    watch: watch::Sender<Session>,
}

impl<K, P, C> SessionStore<K, P, C, TokioSleeper>
where
    K: KeyValueStore,
    P: PopupHost,
    C: CredentialVerifier,
{
    /// Build the store, loading any session persisted under [`STORAGE_KEY`].
    ///
    /// An unreadable or corrupt record is logged and replaced by an anonymous session.
    pub async fn restore(
        config: AuthConfig,
        router: Arc<CallbackRouter>,
        storage: K,
        popups: P,
        credentials: C,
    ) -> Self {
        let session = load_session(&storage).await;
        let (watch, _) = watch::channel(session.clone());

        Self {
            resolver: OidcResolver::new(config.metadata_url.clone()),
            exchange: TokenExchangeClient::new(&config),
            config,
            storage,
            popups,
            credentials,
            router,
            inner: Mutex::new(SessionInner {
                session,
                in_flight: 0,
            }),
            watch,
        }
    }
}

impl<K, P, C, S> SessionStore<K, P, C, S>
where
    K: KeyValueStore,
    P: PopupHost,
    C: CredentialVerifier,
    S: Sleeper,
{
    /// Use a custom HTTP client for discovery, token and user-info requests.
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.resolver = self.resolver.with_http_client(client.clone());
        self.exchange = self.exchange.with_http_client(client);
        self
    }

    /// Replace the user-info back-off sleeper.
    #[must_use]
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> SessionStore<K, P, C, T> {
        SessionStore {
            config: self.config,
            storage: self.storage,
            popups: self.popups,
            credentials: self.credentials,
            resolver: self.resolver,
            exchange: self.exchange.with_sleeper(sleeper),
            router: self.router,
            inner: self.inner,
            watch: self.watch,
        }
    }

    /// Current session.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.watch.borrow().clone()
    }

    /// Receive every committed session change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.watch.subscribe()
    }

    /// Password login.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] if the verifier rejects or fails.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, Error> {
        self.begin_attempt().await;

        let accepted = match self.credentials.verify(username, password).await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "Credential verification failed");
                false
            }
        };

        if !accepted {
            tracing::warn!(username, "Password login rejected");
            self.finish_attempt(None).await;
            return Err(Error::InvalidCredentials);
        }

        let profile = UserProfile {
            user: UserId::from(username),
            email: None,
            name: None,
            picture: None,
        };
        let session = self.finish_attempt(Some(profile)).await;
        tracing::info!(username, "Password login successful");
        Ok(session)
    }

    /// Sign out. A no-op when already anonymous.
    pub async fn logout(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.session.is_authenticated && inner.session.user.is_none() {
            return;
        }
        inner.session.sign_out();
        self.commit(&inner.session).await;
        tracing::info!("Signed out");
    }

    /// Sign in through the identity provider's popup flow.
    ///
    /// Waits at most the configured callback timeout for the redirect. The
    /// attempt's correlation entry is released whether or not a callback arrives.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`], [`Error::PopupBlocked`], [`Error::CallbackTimeout`],
    /// [`Error::Authorization`], [`Error::TokenExchange`] or [`Error::UserInfo`],
    /// each leaving the identity fields untouched.
    pub async fn login_with_sso(&self) -> Result<Session, Error> {
        self.begin_attempt().await;

        match self.run_sso_attempt().await {
            Ok(profile) => {
                let session = self.finish_attempt(Some(profile)).await;
                tracing::info!(user = ?session.user, "SSO login successful");
                Ok(session)
            }
            Err(e) => {
                tracing::error!(error = %e, "SSO login failed");
                self.finish_attempt(None).await;
                Err(e)
            }
        }
    }

    async fn run_sso_attempt(&self) -> Result<UserProfile, Error> {
        let metadata = self.resolver.resolve().await?;
        let request = AuthorizationRequest::new(&metadata, &self.config)?;

        let pending = self.router.register(request.state.clone());
        let (width, height) = self.config.popup_size();
        let popup = popup::launch(&self.popups, request.url.as_str(), width, height)
            .await
            .ok_or(Error::PopupBlocked)?;

        let callback = pending.wait(self.config.callback_timeout).await;
        popup.close().await;
        let callback = callback?;

        if let Some(error) = callback.error {
            return Err(Error::Authorization(error));
        }
        let code = callback
            .code
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Authorization("callback carried no authorization code".into()))?;

        self.exchange.exchange(&metadata, &code).await
    }

    async fn begin_attempt(&self) {
        let mut inner = self.inner.lock().await;
        inner.in_flight += 1;
        inner.session.is_loading = true;
        self.commit(&inner.session).await;
    }

    async fn finish_attempt(&self, profile: Option<UserProfile>) -> Session {
        let mut inner = self.inner.lock().await;
        inner.in_flight = inner.in_flight.saturating_sub(1);
        inner.session.is_loading = inner.in_flight > 0;
        if let Some(profile) = profile {
            inner.session.sign_in(profile);
        }
        self.commit(&inner.session).await;
        inner.session.clone()
    }

    /// Persist and publish. Storage failures are logged; memory stays authoritative.
    async fn commit(&self, session: &Session) {
        let record = PersistedSession {
            state: session.clone(),
            version: STORAGE_VERSION,
        };
        match serde_json::to_string(&record) {
            Ok(json) => {
                if let Err(e) = self.storage.set(STORAGE_KEY, json).await {
                    tracing::error!(error = %e, "Failed to persist session");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode session"),
        }
        self.watch.send_replace(session.clone());
    }
}

async fn load_session<K: KeyValueStore>(storage: &K) -> Session {
    let raw = match storage.get(STORAGE_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return Session::default(),
        Err(e) => {
            tracing::warn!(error = %e, "Could not read persisted session");
            return Session::default();
        }
    };

    match serde_json::from_str::<PersistedSession>(&raw) {
        Ok(record) => record.state.sanitized(),
        Err(e) => {
            tracing::warn!(error = %e, "Discarding corrupt persisted session");
            Session::default()
        }
    }
}
