use super::AccountProfile;
use crate::credentials::Credentials;
use crate::error::AdapterError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;

/// Tokens returned by a code exchange or a refresh.
#[derive(Clone, PartialEq)]
pub struct TokenSet {
    pub access_token: String,
    /// `None` when the provider does not rotate refresh tokens.
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenSet {
    /// Builds the credential blob, keeping `previous_refresh_token` when the
    /// provider did not issue a new one.
    pub fn into_credentials(self, previous_refresh_token: Option<String>) -> Credentials {
        Credentials {
            access_token: self.access_token,
            refresh_token: self.refresh_token.or(previous_refresh_token),
            expires_at: self.expires_at,
            api_secret: None,
        }
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Result of exchanging an authorization code.
#[derive(Clone, Debug)]
pub struct TokenGrant {
    pub tokens: TokenSet,
    pub profile: AccountProfile,
}

/// Provider-specific network calls.
///
/// Adapters are stateless with respect to connections: every call receives the
/// material it needs and returns a classified [`AdapterError`] on failure.
/// Callers own timeouts.
///
/// Operations that do not apply to a provider's auth type keep the default
/// implementation, which reports [`AdapterError::Unsupported`].
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Authorization URL embedding `state`. Pure, no network.
    fn build_authorize_url(
        &self,
        _state: &str,
        _redirect_uri: &str,
        _scopes: &[String],
    ) -> Result<String, AdapterError> {
        Err(AdapterError::Unsupported("authorization URL".to_string()))
    }

    /// Exchanges an authorization code for tokens and the account profile.
    async fn exchange_code(
        &self,
        _code: &str,
        _redirect_uri: &str,
    ) -> Result<TokenGrant, AdapterError> {
        Err(AdapterError::Unsupported("code exchange".to_string()))
    }

    /// Obtains a new access token.
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, AdapterError> {
        Err(AdapterError::Unsupported("token refresh".to_string()))
    }

    /// Checks an API key (and optional secret) against the provider.
    async fn validate_api_key(
        &self,
        _api_key: &str,
        _api_secret: Option<&str>,
    ) -> Result<AccountProfile, AdapterError> {
        Err(AdapterError::Unsupported("API key validation".to_string()))
    }
}

/// Runs a provider call under `timeout`. Elapsing counts as a transient failure.
pub async fn call_with_timeout<T, F>(timeout: Duration, what: &str, call: F) -> Result<T, AdapterError>
where
    F: Future<Output = Result<T, AdapterError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(AdapterError::Transient(format!(
            "{} timed out after {}s",
            what,
            timeout.as_secs()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl ProviderAdapter for Bare {}

    #[tokio::test]
    async fn test_default_operations_are_unsupported() {
        let adapter = Bare;
        assert!(matches!(
            adapter.build_authorize_url("s", "r", &[]),
            Err(AdapterError::Unsupported(_))
        ));
        assert!(matches!(
            adapter.refresh("rt").await,
            Err(AdapterError::Unsupported(_))
        ));
        assert!(matches!(
            adapter.validate_api_key("k", None).await,
            Err(AdapterError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_call_with_timeout_elapses_as_transient() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, AdapterError>(())
        };
        let err = call_with_timeout(Duration::from_millis(10), "refresh", slow)
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Transient(msg) if msg.contains("refresh timed out")));

        let fast = async { Ok::<_, AdapterError>(7) };
        assert_eq!(
            call_with_timeout(Duration::from_secs(1), "refresh", fast).await.unwrap(),
            7
        );
    }

    #[test]
    fn test_token_set_keeps_previous_refresh_token() {
        let rotated = TokenSet {
            access_token: "a2".to_string(),
            refresh_token: Some("r2".to_string()),
            expires_at: None,
        };
        assert_eq!(
            rotated.into_credentials(Some("r1".to_string())).refresh_token,
            Some("r2".to_string())
        );

        let unrotated = TokenSet {
            access_token: "a2".to_string(),
            refresh_token: None,
            expires_at: None,
        };
        assert_eq!(
            unrotated.into_credentials(Some("r1".to_string())).refresh_token,
            Some("r1".to_string())
        );
    }
}
