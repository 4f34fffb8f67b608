use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;

use crate::types::CallbackState;

/// Generates a cryptographically random `state` parameter for one login attempt.
///
/// Returns a 22-character URL-safe string (16 random bytes → base64url).
#[must_use]
pub fn generate_state() -> CallbackState {
    let random_bytes: [u8; 16] = rand::rng().random();
    CallbackState(URL_SAFE_NO_PAD.encode(random_bytes))
}
