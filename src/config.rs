use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::exchange::RetryPolicy;

const DEFAULT_POPUP_WIDTH: u32 = 600;
const DEFAULT_POPUP_HEIGHT: u32 = 700;
const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Identity provider client configuration.
///
/// Required fields are constructor parameters — no runtime "missing field" errors.
///
/// Use [`from_env()`](AuthConfig::from_env) for convention-based setup,
/// or [`new()`](AuthConfig::new) with `with_*` methods for full control.
///
/// ```rust,ignore
/// use companion_auth::AuthConfig;
///
/// let config = AuthConfig::new(
///     "my-client-id",
///     "my-client-secret",
///     "https://app.example.com/auth/callback".parse()?,
///     "https://sso.example.com/.well-known/openid-configuration".parse()?,
/// )
/// .with_popup_size(480, 640);
/// ```
#[derive(Clone)]
#[non_exhaustive]
pub struct AuthConfig {
    pub(crate) client_id: String,
    pub(crate) client_secret: String,
    pub(crate) redirect_uri: Url,
    pub(crate) metadata_url: Url,
    pub(crate) scopes: Vec<String>,
    pub(crate) popup_width: u32,
    pub(crate) popup_height: u32,
    pub(crate) callback_timeout: Duration,
    pub(crate) retry: RetryPolicy,
}

impl AuthConfig {
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_uri: Url,
        metadata_url: Url,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_uri,
            metadata_url,
            scopes: vec!["openid".into(), "profile".into(), "email".into()],
            popup_width: DEFAULT_POPUP_WIDTH,
            popup_height: DEFAULT_POPUP_HEIGHT,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `SSO_CLIENT_ID`: OAuth2 client ID
    /// - `SSO_CLIENT_SECRET`: OAuth2 client secret
    /// - `SSO_REDIRECT_URI`: redirect URL the interceptor watches for
    /// - `SSO_METADATA_URL`: OIDC discovery document URL
    ///
    /// # Optional env vars
    /// - `SSO_SCOPES`: Comma-separated OAuth2 scopes
    /// - `SSO_POPUP_WIDTH`, `SSO_POPUP_HEIGHT`: popup size in pixels
    /// - `SSO_CALLBACK_TIMEOUT_SECS`: how long a login waits for its callback
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if required env vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let required = |key: &str| {
            lookup(key).ok_or_else(|| Error::InvalidConfig(format!("{key} is required")))
        };
        let parse_url = |key: &str, raw: String| {
            raw.parse::<Url>()
                .map_err(|e| Error::InvalidConfig(format!("{key}: {e}")))
        };
        let parse_number = |key: &str, raw: String| {
            raw.trim()
                .parse::<u64>()
                .map_err(|e| Error::InvalidConfig(format!("{key}: {e}")))
        };

        let client_id = required("SSO_CLIENT_ID")?;
        let client_secret = required("SSO_CLIENT_SECRET")?;
        let redirect_uri = parse_url("SSO_REDIRECT_URI", required("SSO_REDIRECT_URI")?)?;
        let metadata_url = parse_url("SSO_METADATA_URL", required("SSO_METADATA_URL")?)?;

        let mut config = Self::new(client_id, client_secret, redirect_uri, metadata_url);

        if let Some(scopes) = lookup("SSO_SCOPES") {
            config = config.with_scopes(
                scopes
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            );
        }

        let width = lookup("SSO_POPUP_WIDTH")
            .map(|raw| parse_number("SSO_POPUP_WIDTH", raw))
            .transpose()?;
        let height = lookup("SSO_POPUP_HEIGHT")
            .map(|raw| parse_number("SSO_POPUP_HEIGHT", raw))
            .transpose()?;
        if width.is_some() || height.is_some() {
            let width = width.map_or(Ok(config.popup_width), u32::try_from);
            let height = height.map_or(Ok(config.popup_height), u32::try_from);
            let (Ok(width), Ok(height)) = (width, height) else {
                return Err(Error::InvalidConfig("popup size out of range".into()));
            };
            config = config.with_popup_size(width, height);
        }

        if let Some(raw) = lookup("SSO_CALLBACK_TIMEOUT_SECS") {
            let secs = parse_number("SSO_CALLBACK_TIMEOUT_SECS", raw)?;
            config = config.with_callback_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// Override the OAuth2 scopes (default: `["openid", "profile", "email"]`).
    #[must_use]
    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// Override the popup size (default: 600×700).
    #[must_use]
    pub fn with_popup_size(mut self, width: u32, height: u32) -> Self {
        self.popup_width = width;
        self.popup_height = height;
        self
    }

    /// Override how long a login attempt waits for its redirect callback.
    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = timeout;
        self
    }

    /// Override the user-info retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Redirect URL; also the exact prefix the navigation interceptor matches.
    #[must_use]
    pub fn redirect_uri(&self) -> &Url {
        &self.redirect_uri
    }

    /// OIDC discovery document URL.
    #[must_use]
    pub fn metadata_url(&self) -> &Url {
        &self.metadata_url
    }

    #[must_use]
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    #[must_use]
    pub fn popup_size(&self) -> (u32, u32) {
        (self.popup_width, self.popup_height)
    }

    #[must_use]
    pub fn callback_timeout(&self) -> Duration {
        self.callback_timeout
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("redirect_uri", &self.redirect_uri.as_str())
            .field("metadata_url", &self.metadata_url.as_str())
            .field("scopes", &self.scopes)
            .field("popup_width", &self.popup_width)
            .field("popup_height", &self.popup_height)
            .field("callback_timeout", &self.callback_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}
