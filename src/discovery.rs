use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Endpoints advertised by the identity provider's discovery document.
///
/// A resolved document always carries non-empty authorization, token and
/// user-info endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProviderMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub scopes_supported: Vec<String>,
}

impl ProviderMetadata {
    #[must_use]
    pub fn new(authorization_endpoint: impl Into<String>, token_endpoint: impl Into<String>) -> Self {
        Self {
            issuer: None,
            authorization_endpoint: authorization_endpoint.into(),
            token_endpoint: token_endpoint.into(),
            userinfo_endpoint: None,
            end_session_endpoint: None,
            scopes_supported: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_userinfo_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.userinfo_endpoint = Some(endpoint.into());
        self
    }

    fn validate(self) -> Result<Self, Error> {
        if self.authorization_endpoint.trim().is_empty() || self.token_endpoint.trim().is_empty() {
            return Err(Error::Configuration(
                "discovery document lacks authorization or token endpoint".into(),
            ));
        }
        if self.userinfo_endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
            return Err(Error::Configuration(
                "discovery document lacks userinfo_endpoint".into(),
            ));
        }
        Ok(self)
    }
}

/// Fetches the discovery document fresh for every login attempt.
#[derive(Debug, Clone)]
pub struct OidcResolver {
    metadata_url: Url,
    http: reqwest::Client,
}

impl OidcResolver {
    #[must_use]
    pub fn new(metadata_url: Url) -> Self {
        Self {
            metadata_url,
            http: reqwest::Client::new(),
        }
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Resolve the provider endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the document is unreachable, not JSON,
    /// or missing the authorization, token or user-info endpoint.
    pub async fn resolve(&self) -> Result<ProviderMetadata, Error> {
        tracing::debug!(url = %self.metadata_url, "Fetching OIDC discovery document");

        let response = self
            .http
            .get(self.metadata_url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, url = %self.metadata_url, "OIDC discovery unreachable");
                Error::Configuration(format!("discovery request failed: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, "OIDC discovery endpoint returned error");
            return Err(Error::Configuration(format!(
                "discovery endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Configuration(format!("discovery body unreadable: {e}")))?;

        serde_json::from_slice::<ProviderMetadata>(&body)
            .map_err(|e| {
                tracing::error!(error = %e, "Invalid OIDC discovery document");
                Error::Configuration(format!("invalid discovery document: {e}"))
            })?
            .validate()
    }
}
