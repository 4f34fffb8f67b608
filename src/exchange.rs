use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::discovery::ProviderMetadata;
use crate::error::Error;
use crate::types::UserId;

/// User-info retry schedule: `max_attempts` total, sleeping
/// `attempt × base_delay` after each failed attempt that is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the given failed attempt (1-based): 1s, 2s, ...
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Async sleep abstraction so back-off can be observed in tests.
pub trait Sleeper: Send + Sync + 'static {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Tokio-backed sleeper used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// Token response from the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Raw user-info claims as returned by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UserInfo {
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Identity attributes handed to the session store after a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user: UserId,
    pub email: Option<String>,
    pub name: Option<String>,
    pub picture: Option<String>,
}

impl UserProfile {
    /// Map provider claims to a profile; `attempts` is how many user-info
    /// requests it took to obtain them.
    ///
    /// # Errors
    ///
    /// [`Error::UserInfo`] if the claims carry neither `preferred_username` nor `email`.
    pub fn from_user_info(info: UserInfo, attempts: u32) -> Result<Self, Error> {
        let user = info
            .preferred_username
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| info.email.clone().filter(|s| !s.is_empty()))
            .ok_or_else(|| Error::UserInfo {
                attempts,
                detail: "profile has neither preferred_username nor email".into(),
            })?;

        Ok(Self {
            user: UserId(user),
            email: info.email,
            name: info.name,
            picture: info.picture,
        })
    }
}

/// Why one user-info request did not produce claims.
enum UserInfoFailure {
    /// Transport failure or non-2xx status; worth another attempt.
    Retryable(String),
    /// The provider answered 2xx with a body that is not user info.
    Fatal(String),
}

/// Exchanges an authorization code for the signed-in user's profile.
pub struct TokenExchangeClient<S = TokioSleeper> {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    retry: RetryPolicy,
    http: reqwest::Client,
    sleeper: S,
}

impl TokenExchangeClient<TokioSleeper> {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.to_string(),
            retry: config.retry,
            http: reqwest::Client::new(),
            sleeper: TokioSleeper,
        }
    }
}

impl<S: Sleeper> TokenExchangeClient<S> {
    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Replace the back-off sleeper.
    #[must_use]
    pub fn with_sleeper<T: Sleeper>(self, sleeper: T) -> TokenExchangeClient<T> {
        TokenExchangeClient {
            client_id: self.client_id,
            client_secret: self.client_secret,
            redirect_uri: self.redirect_uri,
            retry: self.retry,
            http: self.http,
            sleeper,
        }
    }

    /// Exchange `code` at the token endpoint, then resolve the user's profile.
    ///
    /// # Errors
    ///
    /// [`Error::TokenExchange`] if the token endpoint fails or returns no access token,
    /// [`Error::UserInfo`] if every user-info attempt fails or the profile is unusable,
    /// [`Error::Configuration`] if the provider advertises no user-info endpoint.
    pub async fn exchange(
        &self,
        metadata: &ProviderMetadata,
        code: &str,
    ) -> Result<UserProfile, Error> {
        // Checked before the single-use code is spent.
        let userinfo_endpoint = metadata
            .userinfo_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| {
                Error::Configuration("discovery document lacks userinfo_endpoint".into())
            })?;

        let access_token = self.request_token(&metadata.token_endpoint, code).await?;
        self.fetch_user_info(userinfo_endpoint, &access_token).await
    }

    async fn request_token(&self, token_endpoint: &str, code: &str) -> Result<String, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];

        let response = self
            .http
            .post(token_endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| Error::TokenExchange {
                status: None,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::TokenExchange {
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        let tokens: TokenResponse = response.json().await.map_err(|e| Error::TokenExchange {
            status: Some(status.as_u16()),
            detail: format!("undecodable token response: {e}"),
        })?;

        tokens
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::TokenExchange {
                status: Some(status.as_u16()),
                detail: "no access token received".into(),
            })
    }

    async fn fetch_user_info(
        &self,
        endpoint: &str,
        access_token: &str,
    ) -> Result<UserProfile, Error> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_failure = String::new();

        for attempt in 1..=max_attempts {
            match self.try_user_info(endpoint, access_token).await {
                Ok(info) => return UserProfile::from_user_info(info, attempt),
                Err(UserInfoFailure::Fatal(detail)) => {
                    tracing::error!(attempt, detail = %detail, "User info response rejected");
                    return Err(Error::UserInfo {
                        attempts: attempt,
                        detail,
                    });
                }
                Err(UserInfoFailure::Retryable(reason)) => {
                    tracing::warn!(attempt, max_attempts, reason = %reason, "User info request failed");
                    last_failure = reason;
                }
            }

            if attempt < max_attempts {
                self.sleeper.sleep(self.retry.delay_after(attempt)).await;
            }
        }

        Err(Error::UserInfo {
            attempts: max_attempts,
            detail: last_failure,
        })
    }

    async fn try_user_info(
        &self,
        endpoint: &str,
        access_token: &str,
    ) -> Result<UserInfo, UserInfoFailure> {
        let response = self
            .http
            .get(endpoint)
            .bearer_auth(access_token)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| UserInfoFailure::Retryable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UserInfoFailure::Retryable(format!("HTTP {}", status.as_u16())));
        }
        response
            .json::<UserInfo>()
            .await
            .map_err(|e| UserInfoFailure::Fatal(format!("undecodable user info: {e}")))
    }
}
