use url::Url;

use crate::config::AuthConfig;
use crate::discovery::ProviderMetadata;
use crate::error::Error;
use crate::nonce;
use crate::types::CallbackState;

/// Authorization URL plus the nonce its callback must echo back.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRequest {
    pub url: Url,
    pub state: CallbackState,
}

impl AuthorizationRequest {
    /// Build a request for a fresh login attempt with a newly generated `state`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the advertised authorization endpoint is not a URL.
    pub fn new(metadata: &ProviderMetadata, config: &AuthConfig) -> Result<Self, Error> {
        Self::with_state(metadata, config, nonce::generate_state())
    }

    pub(crate) fn with_state(
        metadata: &ProviderMetadata,
        config: &AuthConfig,
        state: CallbackState,
    ) -> Result<Self, Error> {
        let mut url: Url = metadata.authorization_endpoint.parse().map_err(|e| {
            Error::Configuration(format!("authorization_endpoint is not a URL: {e}"))
        })?;
        let scope = config.scopes.join(" ");

        url.query_pairs_mut()
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", config.redirect_uri.as_str())
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("state", state.as_str());

        Ok(Self { url, state })
    }
}
