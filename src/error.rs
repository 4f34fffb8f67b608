/// Failures of a login attempt or of the session plumbing around it.
///
/// Every variant aborts only the attempt that produced it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Discovery document unreachable, undecodable, or missing required endpoints.
    #[error("OIDC configuration error: {0}")]
    Configuration(String),

    /// The host refused to open the login popup.
    #[error("login popup was blocked")]
    PopupBlocked,

    /// The identity provider redirected back with an explicit `error`.
    #[error("authorization denied by provider: {0}")]
    Authorization(String),

    /// Token endpoint rejected the code or returned no access token.
    #[error("token exchange failed{}: {detail}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    TokenExchange { status: Option<u16>, detail: String },

    /// User-info endpoint never answered successfully.
    #[error("user info unavailable after {attempts} attempt(s): {detail}")]
    UserInfo { attempts: u32, detail: String },

    /// Password login rejected.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// No callback arrived for the pending attempt in time.
    #[error("timed out waiting for the authorization callback")]
    CallbackTimeout,

    /// The attempt was cancelled through the router before a callback arrived.
    #[error("authorization callback channel closed")]
    CallbackDropped,

    /// Durable storage read or write failed.
    #[error("session storage error: {0}")]
    Storage(String),

    /// Missing or malformed local configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
