//! Single-use OAuth state tokens (CSRF protection + callback correlation).

use super::ConnectionMetadata;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

/// Bytes of randomness in a state token (256 bits).
const STATE_BYTES: usize = 32;

/// A state token issued at install time and consumed exactly once at callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OAuthState {
    pub state: String,
    pub user_id: String,
    pub provider_id: String,
    /// Where the browser is sent once the callback completes.
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
    /// Install metadata applied to the connection at callback time.
    pub metadata: ConnectionMetadata,
    pub source: Option<String>,
}

impl OAuthState {
    /// Issues a fresh, unconsumed state with an unguessable token.
    pub fn issue(
        user_id: &str,
        provider_id: &str,
        redirect_uri: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: generate_state_token(),
            user_id: user_id.to_string(),
            provider_id: provider_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            created_at: now,
            expires_at: now + ttl,
            consumed: false,
            metadata: ConnectionMetadata::default(),
            source: None,
        }
    }

    /// Carries validated install metadata through the authorization round trip.
    pub fn with_install_context(mut self, metadata: ConnectionMetadata, source: Option<String>) -> Self {
        self.metadata = metadata;
        self.source = source;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn generate_state_token() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
