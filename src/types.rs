use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

/// Authenticated user identifier.
///
/// For SSO logins this is the provider's `preferred_username`, falling back to
/// `email`; for password logins it is the username that was checked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// OAuth `state` nonce correlating an authorization request with its callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into)]
#[serde(transparent)]
pub struct CallbackState(pub String);

impl CallbackState {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CallbackState {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Browser tab identifier as reported by navigation events.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, From, Into,
)]
#[serde(transparent)]
pub struct TabId(pub i64);
