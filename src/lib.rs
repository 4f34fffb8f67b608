#![doc = include_str!("../README.md")]

pub mod authorize;
pub mod bus;
pub mod callback;
pub mod config;
pub mod discovery;
pub mod error;
pub mod exchange;
pub mod interceptor;
pub mod nonce;
pub mod popup;
pub mod session;
pub mod storage;
pub mod types;

// Re-exports for convenient access
pub use authorize::AuthorizationRequest;
pub use bus::{ExtensionMessage, MessageBus, OAuthCallback};
pub use callback::{CallbackRouter, PendingCallback};
pub use config::AuthConfig;
pub use discovery::{OidcResolver, ProviderMetadata};
pub use error::Error;
pub use exchange::{RetryPolicy, Sleeper, TokenExchangeClient, TokioSleeper, UserProfile};
pub use interceptor::{NavigationEvent, NavigationInterceptor, NavigationOutcome, TabHost};
pub use nonce::generate_state;
pub use popup::{PopupGeometry, PopupHost, PopupRequest, PopupWindow, WindowBounds};
pub use session::{CredentialVerifier, ReportingIdentity, Session, SessionPhase, SessionStore};
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use types::{CallbackState, TabId, UserId};
