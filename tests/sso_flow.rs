use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::AUTHORIZATION};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use companion_auth::{
    AuthConfig, CallbackRouter, CredentialVerifier, Error, FileStore, KeyValueStore, MessageBus,
    NavigationEvent, NavigationInterceptor, PopupHost, PopupRequest, PopupWindow, SessionPhase,
    SessionStore, Sleeper, TabHost, TabId, UserId, WindowBounds,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const REDIRECT: &str = "https://companion.example.com/auth/callback";

// ── Mock identity provider ─────────────────────────────────────────

#[derive(Clone)]
struct Script {
    discovery_status: u16,
    discovery: Option<Value>,
    discovery_raw: Option<&'static str>,
    token_status: u16,
    token_body: Value,
    userinfo_failures: usize,
    userinfo_body: Value,
    userinfo_raw: Option<&'static str>,
}

impl Script {
    fn happy() -> Self {
        Self {
            discovery_status: 200,
            discovery: None,
            discovery_raw: None,
            token_status: 200,
            token_body: json!({"access_token": "tok", "token_type": "Bearer"}),
            userinfo_failures: 0,
            userinfo_body: json!({"email": "a@b.com", "name": "A B"}),
            userinfo_raw: None,
        }
    }
}

#[derive(Clone)]
struct Provider {
    base: String,
    script: Script,
    token_forms: Arc<Mutex<Vec<HashMap<String, String>>>>,
    bearer_headers: Arc<Mutex<Vec<String>>>,
    userinfo_calls: Arc<AtomicUsize>,
}

async fn discovery(State(provider): State<Provider>) -> Response {
    let status = StatusCode::from_u16(provider.script.discovery_status).unwrap();
    if let Some(raw) = provider.script.discovery_raw {
        return (status, raw).into_response();
    }
    let base = &provider.base;
    let document = provider.script.discovery.clone().unwrap_or_else(|| {
        json!({
            "issuer": base,
            "authorization_endpoint": format!("{base}/authorize"),
            "token_endpoint": format!("{base}/token"),
            "userinfo_endpoint": format!("{base}/userinfo"),
        })
    });
    (status, Json(document)).into_response()
}

async fn token(
    State(provider): State<Provider>,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    provider.token_forms.lock().unwrap().push(form);
    (
        StatusCode::from_u16(provider.script.token_status).unwrap(),
        Json(provider.script.token_body.clone()),
    )
}

async fn userinfo(State(provider): State<Provider>, headers: HeaderMap) -> Response {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        provider.bearer_headers.lock().unwrap().push(value.to_string());
    }
    let call = provider.userinfo_calls.fetch_add(1, Ordering::SeqCst) + 1;
    if call <= provider.script.userinfo_failures {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    if let Some(raw) = provider.script.userinfo_raw {
        return raw.into_response();
    }
    Json(provider.script.userinfo_body.clone()).into_response()
}

async fn start_provider(script: Script) -> Provider {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let provider = Provider {
        base: format!("http://{addr}"),
        script,
        token_forms: Arc::default(),
        bearer_headers: Arc::default(),
        userinfo_calls: Arc::default(),
    };

    let app = Router::new()
        .route("/.well-known/openid-configuration", get(discovery))
        .route("/token", post(token))
        .route("/userinfo", get(userinfo))
        .with_state(provider.clone());

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    provider
}

// ── Host fakes ─────────────────────────────────────────────────────

enum UserAction {
    Approve(&'static str),
    Deny(&'static str),
    Abandon,
    /// Report each generated `state` to the test, which drives the redirect itself.
    Hand(mpsc::UnboundedSender<String>),
}

struct TestWindow {
    closed: Arc<AtomicUsize>,
}

impl PopupWindow for TestWindow {
    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedUser {
    action: UserAction,
    allow_popups: bool,
    navigations: mpsc::Sender<NavigationEvent>,
    opened: Arc<Mutex<Vec<PopupRequest>>>,
    closed: Arc<AtomicUsize>,
}

impl PopupHost for ScriptedUser {
    type Window = TestWindow;

    fn parent_bounds(&self) -> WindowBounds {
        WindowBounds {
            screen_x: 0,
            screen_y: 0,
            outer_width: 1200,
            outer_height: 900,
        }
    }

    async fn open(&self, request: PopupRequest) -> Option<TestWindow> {
        if !self.allow_popups {
            return None;
        }
        let state = query(&request.url, "state").expect("authorization URL carries state");
        self.opened.lock().unwrap().push(request);

        let redirect = match &self.action {
            UserAction::Approve(code) => Some(format!("{REDIRECT}?code={code}&state={state}")),
            UserAction::Deny(error) => Some(format!("{REDIRECT}?error={error}&state={state}")),
            UserAction::Abandon => None,
            UserAction::Hand(tx) => {
                tx.send(state).unwrap();
                None
            }
        };
        if let Some(url) = redirect {
            self.navigations
                .send(NavigationEvent {
                    tab_id: TabId(42),
                    url,
                })
                .await
                .unwrap();
        }

        Some(TestWindow {
            closed: Arc::clone(&self.closed),
        })
    }
}

#[derive(Clone, Default)]
struct RecordingTabs {
    removed: Arc<Mutex<Vec<TabId>>>,
}

impl TabHost for RecordingTabs {
    async fn remove_tab(&self, tab_id: TabId) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.removed.lock().unwrap().push(tab_id);
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RecordingSleeper {
    durations: Arc<Mutex<Vec<Duration>>>,
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.durations.lock().unwrap().push(duration);
    }
}

struct NoPasswords;

impl CredentialVerifier for NoPasswords {
    async fn verify(
        &self,
        _username: &str,
        _password: &str,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        Ok(false)
    }
}

fn query(url: &str, key: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

// ── Harness ────────────────────────────────────────────────────────

type Store = SessionStore<FileStore, ScriptedUser, NoPasswords, RecordingSleeper>;

struct Harness {
    store: Arc<Store>,
    provider: Provider,
    router: Arc<CallbackRouter>,
    navigations: mpsc::Sender<NavigationEvent>,
    opened: Arc<Mutex<Vec<PopupRequest>>>,
    closed: Arc<AtomicUsize>,
    tabs: RecordingTabs,
    sleeper: RecordingSleeper,
    data_dir: tempfile::TempDir,
}

impl Harness {
    async fn start(script: Script, action: UserAction) -> Self {
        Self::start_with(script, action, true, Duration::from_secs(30)).await
    }

    async fn start_with(
        script: Script,
        action: UserAction,
        allow_popups: bool,
        callback_timeout: Duration,
    ) -> Self {
        let provider = start_provider(script).await;
        let config = AuthConfig::new(
            "client-1",
            "s3cret",
            REDIRECT.parse().unwrap(),
            format!("{}/.well-known/openid-configuration", provider.base)
                .parse()
                .unwrap(),
        )
        .with_callback_timeout(callback_timeout);

        let bus = MessageBus::new();
        let router = CallbackRouter::new();
        router.spawn(&bus);

        let tabs = RecordingTabs::default();
        let interceptor = NavigationInterceptor::new(config.redirect_uri(), bus, tabs.clone());
        let (navigations, events) = mpsc::channel(8);
        tokio::spawn(async move { interceptor.run(events).await });

        let opened = Arc::default();
        let closed = Arc::default();
        let user = ScriptedUser {
            action,
            allow_popups,
            navigations: navigations.clone(),
            opened: Arc::clone(&opened),
            closed: Arc::clone(&closed),
        };

        let data_dir = tempfile::tempdir().unwrap();
        let sleeper = RecordingSleeper::default();
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let store = SessionStore::restore(
            config,
            Arc::clone(&router),
            FileStore::new(data_dir.path()),
            user,
            NoPasswords,
        )
        .await
        .with_http_client(http)
        .with_sleeper(sleeper.clone());

        Self {
            store: Arc::new(store),
            provider,
            router,
            navigations,
            opened,
            closed,
            tabs,
            sleeper,
            data_dir,
        }
    }

    async fn navigate(&self, url: String) {
        self.navigations
            .send(NavigationEvent {
                tab_id: TabId(7),
                url,
            })
            .await
            .unwrap();
    }

    async fn persisted(&self) -> Value {
        let raw = FileStore::new(self.data_dir.path())
            .get("auth-storage")
            .await
            .unwrap()
            .expect("session persisted");
        serde_json::from_str::<Value>(&raw).unwrap()["state"].clone()
    }

    fn delays(&self) -> Vec<Duration> {
        self.sleeper.durations.lock().unwrap().clone()
    }

    fn assert_anonymous(&self) {
        let session = self.store.snapshot();
        assert!(!session.is_authenticated);
        assert!(!session.is_loading);
        assert!(session.user.is_none());
        assert!(session.email.is_none());
        assert!(session.name.is_none());
        assert_eq!(session.phase(), SessionPhase::Anonymous);
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sso_login_happy_path() {
    let h = Harness::start(Script::happy(), UserAction::Approve("abc")).await;

    let session = h.store.login_with_sso().await.unwrap();

    assert!(session.is_authenticated);
    assert!(!session.is_loading);
    assert_eq!(session.user, Some(UserId::from("a@b.com")));
    assert_eq!(session.email.as_deref(), Some("a@b.com"));
    assert_eq!(session.name.as_deref(), Some("A B"));
    assert_eq!(session.phase(), SessionPhase::Authenticated);

    let forms = h.provider.token_forms.lock().unwrap().clone();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0]["grant_type"], "authorization_code");
    assert_eq!(forms[0]["code"], "abc");
    assert_eq!(forms[0]["redirect_uri"], REDIRECT);
    assert_eq!(forms[0]["client_id"], "client-1");
    assert_eq!(forms[0]["client_secret"], "s3cret");
    assert_eq!(
        *h.provider.bearer_headers.lock().unwrap(),
        vec!["Bearer tok".to_string()]
    );

    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    assert_eq!(*h.tabs.removed.lock().unwrap(), vec![TabId(42)]);
    assert!(h.delays().is_empty());
    assert_eq!(h.router.pending_count(), 0);

    let persisted = h.persisted().await;
    assert_eq!(persisted["isAuthenticated"], true);
    assert_eq!(persisted["isLoading"], false);
    assert_eq!(persisted["user"], "a@b.com");
}

#[tokio::test]
async fn test_authorization_url_targets_discovered_endpoint() {
    let h = Harness::start(Script::happy(), UserAction::Approve("abc")).await;
    h.store.login_with_sso().await.unwrap();

    let opened = h.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    let url = &opened[0].url;
    assert!(url.starts_with(&format!("{}/authorize?", h.provider.base)));
    assert_eq!(query(url, "client_id").as_deref(), Some("client-1"));
    assert_eq!(query(url, "redirect_uri").as_deref(), Some(REDIRECT));
    assert_eq!(query(url, "response_type").as_deref(), Some("code"));
    assert_eq!(query(url, "scope").as_deref(), Some("openid profile email"));
    assert_eq!(opened[0].name, "oauth-popup");
    assert_eq!((opened[0].geometry.left, opened[0].geometry.top), (300, 100));
}

#[tokio::test]
async fn test_user_info_retries_then_succeeds() {
    let script = Script {
        userinfo_failures: 2,
        userinfo_body: json!({"preferred_username": "ab", "email": "a@b.com"}),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let session = h.store.login_with_sso().await.unwrap();

    assert_eq!(session.user, Some(UserId::from("ab")));
    assert_eq!(h.provider.userinfo_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.delays(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn test_user_info_exhaustion_leaves_session_untouched() {
    let script = Script {
        userinfo_failures: 3,
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::UserInfo { attempts: 3, .. }), "unexpected error: {err}");
    assert_eq!(h.provider.userinfo_calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        h.delays(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    h.assert_anonymous();
    assert_eq!(h.persisted().await["isAuthenticated"], false);
}

#[tokio::test]
async fn test_token_endpoint_rejection_sets_no_identity() {
    let script = Script {
        token_status: 400,
        token_body: json!({"error": "invalid_grant"}),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(
        matches!(err, Error::TokenExchange { status: Some(400), ref detail } if detail.contains("invalid_grant")),
        "unexpected error: {err}"
    );
    assert_eq!(h.provider.token_forms.lock().unwrap().len(), 1);
    assert_eq!(h.provider.userinfo_calls.load(Ordering::SeqCst), 0);
    h.assert_anonymous();
}

#[tokio::test]
async fn test_missing_access_token_is_exchange_error() {
    let script = Script {
        token_body: json!({"token_type": "Bearer"}),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::TokenExchange { .. }), "unexpected error: {err}");
    assert_eq!(h.provider.userinfo_calls.load(Ordering::SeqCst), 0);
    h.assert_anonymous();
}

#[tokio::test]
async fn test_provider_error_fails_without_exchange() {
    let h = Harness::start(Script::happy(), UserAction::Deny("access_denied")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::Authorization(ref e) if e == "access_denied"));
    assert!(h.provider.token_forms.lock().unwrap().is_empty());
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    h.assert_anonymous();
}

#[tokio::test]
async fn test_blocked_popup_fails_attempt() {
    let h = Harness::start_with(
        Script::happy(),
        UserAction::Approve("abc"),
        false,
        Duration::from_secs(30),
    )
    .await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::PopupBlocked));
    assert_eq!(h.router.pending_count(), 0);
    h.assert_anonymous();
}

#[tokio::test]
async fn test_abandoned_popup_times_out() {
    let h = Harness::start_with(
        Script::happy(),
        UserAction::Abandon,
        true,
        Duration::from_millis(100),
    )
    .await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::CallbackTimeout));
    assert_eq!(h.router.pending_count(), 0);
    assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    h.assert_anonymous();
}

#[tokio::test]
async fn test_incomplete_discovery_document_is_configuration_error() {
    let script = Script {
        discovery: Some(json!({"authorization_endpoint": "https://sso.example.com/authorize"})),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::Configuration(_)), "unexpected error: {err}");
    assert!(h.opened.lock().unwrap().is_empty());
    h.assert_anonymous();
}

#[tokio::test]
async fn test_discovery_server_error_is_configuration_error() {
    let script = Script {
        discovery_status: 500,
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(
        matches!(err, Error::Configuration(ref e) if e.contains("500")),
        "unexpected error: {err}"
    );
    assert!(h.opened.lock().unwrap().is_empty());
    h.assert_anonymous();
}

#[tokio::test]
async fn test_non_json_discovery_is_configuration_error() {
    let script = Script {
        discovery_raw: Some("<html>maintenance</html>"),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::Configuration(_)), "unexpected error: {err}");
    assert!(h.opened.lock().unwrap().is_empty());
    h.assert_anonymous();
}

#[tokio::test]
async fn test_discovery_without_userinfo_endpoint_opens_no_popup() {
    let script = Script {
        discovery: Some(json!({
            "authorization_endpoint": "https://sso.example.com/authorize",
            "token_endpoint": "https://sso.example.com/token",
        })),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(
        matches!(err, Error::Configuration(ref e) if e.contains("userinfo_endpoint")),
        "unexpected error: {err}"
    );
    assert!(h.opened.lock().unwrap().is_empty());
    assert!(h.provider.token_forms.lock().unwrap().is_empty());
    h.assert_anonymous();
}

#[tokio::test]
async fn test_undecodable_user_info_is_not_retried() {
    let script = Script {
        userinfo_raw: Some("not json"),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::UserInfo { attempts: 1, .. }), "unexpected error: {err}");
    assert_eq!(h.provider.userinfo_calls.load(Ordering::SeqCst), 1);
    assert!(h.delays().is_empty());
    h.assert_anonymous();
}

#[tokio::test]
async fn test_profile_error_reports_attempts_used() {
    let script = Script {
        userinfo_failures: 2,
        userinfo_body: json!({"name": "No Identifier"}),
        ..Script::happy()
    };
    let h = Harness::start(script, UserAction::Approve("abc")).await;

    let err = h.store.login_with_sso().await.unwrap_err();

    assert!(matches!(err, Error::UserInfo { attempts: 3, .. }), "unexpected error: {err}");
    assert_eq!(h.provider.userinfo_calls.load(Ordering::SeqCst), 3);
    h.assert_anonymous();
}

#[tokio::test]
async fn test_callbacks_only_reach_their_own_attempt() {
    let (states_tx, mut states) = mpsc::unbounded_channel();
    let h = Harness::start(Script::happy(), UserAction::Hand(states_tx)).await;

    let first = tokio::spawn({
        let store = Arc::clone(&h.store);
        async move { store.login_with_sso().await }
    });
    let s1 = states.recv().await.unwrap();
    let second = tokio::spawn({
        let store = Arc::clone(&h.store);
        async move { store.login_with_sso().await }
    });
    let s2 = states.recv().await.unwrap();

    assert_ne!(s1, s2);
    assert_eq!(h.router.pending_count(), 2);

    h.navigate(format!("{REDIRECT}?code=forged&state=bogus")).await;
    h.navigate(format!("{REDIRECT}?code=abc&state={s1}")).await;

    let session = first.await.unwrap().unwrap();
    assert!(session.is_authenticated);
    assert!(session.is_loading, "second attempt still in flight");
    assert!(!second.is_finished());
    assert_eq!(h.router.pending_count(), 1);

    let forms = h.provider.token_forms.lock().unwrap().clone();
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0]["code"], "abc");

    h.navigate(format!("{REDIRECT}?error=access_denied&state={s2}")).await;
    let err = second.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Authorization(ref e) if e == "access_denied"));

    let session = h.store.snapshot();
    assert!(session.is_authenticated);
    assert!(!session.is_loading);
    assert_eq!(session.user, Some(UserId::from("a@b.com")));
    assert_eq!(h.router.pending_count(), 0);
}

#[tokio::test]
async fn test_session_survives_restart() {
    let h = Harness::start(Script::happy(), UserAction::Approve("abc")).await;
    h.store.login_with_sso().await.unwrap();

    let (navigations, _events) = mpsc::channel(1);
    let restarted = SessionStore::restore(
        AuthConfig::new(
            "client-1",
            "s3cret",
            REDIRECT.parse().unwrap(),
            format!("{}/.well-known/openid-configuration", h.provider.base)
                .parse()
                .unwrap(),
        ),
        CallbackRouter::new(),
        FileStore::new(h.data_dir.path()),
        ScriptedUser {
            action: UserAction::Abandon,
            allow_popups: true,
            navigations,
            opened: Arc::default(),
            closed: Arc::default(),
        },
        NoPasswords,
    )
    .await;

    let session = restarted.snapshot();
    assert!(session.is_authenticated);
    assert_eq!(session.user, Some(UserId::from("a@b.com")));
    assert_eq!(session.name.as_deref(), Some("A B"));

    restarted.logout().await;
    assert!(!restarted.snapshot().is_authenticated);
    let raw = FileStore::new(h.data_dir.path())
        .get("auth-storage")
        .await
        .unwrap()
        .unwrap();
    assert!(raw.contains(r#""isAuthenticated":false"#));
}
