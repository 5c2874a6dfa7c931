//! Request identity and shared-secret checks.
//!
//! Callers present an opaque bearer token issued upstream; a [`UserResolver`]
//! maps it to the user the request acts for. With auth disabled every request
//! acts as [`DEFAULT_USER`].

use anyhow::bail;
use axum::http::HeaderMap;
use dashmap::DashMap;

#[cfg(test)]
mod tests;

/// User id assigned to every request when auth is disabled.
pub const DEFAULT_USER: &str = "default";

/// Extract bearer token from the HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Maps an incoming request to the user it acts for.
pub trait UserResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Result<String, TokenError>;
}

/// Auth disabled: headers are ignored and everyone is [`DEFAULT_USER`].
pub struct SingleUser;

impl UserResolver for SingleUser {
    fn resolve(&self, _headers: &HeaderMap) -> Result<String, TokenError> {
        Ok(DEFAULT_USER.to_string())
    }
}

/// Bearer tokens bound to user ids.
///
/// A token only identifies the user it was registered for; an unregistered
/// token, including a bare user id, is rejected.
#[derive(Debug, Default)]
pub struct TokenDirectory {
    /// token -> user_id
    users_by_token: DashMap<String, String>,
}

impl TokenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `user_id:token` pairs separated by commas.
    ///
    /// Error messages name the entry position, never the token.
    pub fn parse(pairs: &str) -> anyhow::Result<Self> {
        let directory = Self::new();
        for (position, entry) in pairs.split(',').map(str::trim).enumerate() {
            if entry.is_empty() {
                continue;
            }
            let Some((user_id, token)) = entry.split_once(':') else {
                bail!("user token entry {} is not user_id:token", position + 1);
            };
            let (user_id, token) = (user_id.trim(), token.trim());
            if user_id.is_empty() || token.is_empty() {
                bail!("user token entry {} has an empty user id or token", position + 1);
            }
            if directory.users_by_token.contains_key(token) {
                bail!("user token entry {} repeats an earlier token", position + 1);
            }
            directory.insert(token, user_id);
        }
        Ok(directory)
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.users_by_token.insert(token.into(), user_id.into());
    }

    /// Returns whether the token was registered.
    pub fn revoke(&self, token: &str) -> bool {
        self.users_by_token.remove(token).is_some()
    }

    pub fn len(&self) -> usize {
        self.users_by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users_by_token.is_empty()
    }
}

impl UserResolver for TokenDirectory {
    fn resolve(&self, headers: &HeaderMap) -> Result<String, TokenError> {
        let token = extract_bearer_token(headers)?;
        self.users_by_token
            .get(&token)
            .map(|user| user.value().clone())
            .ok_or(TokenError::Unknown)
    }
}

/// Checks a bearer credential against a shared secret in constant time.
///
/// No configured secret means nothing is accepted.
pub fn verify_shared_secret(headers: &HeaderMap, expected: Option<&str>) -> Result<(), TokenError> {
    let expected = expected.filter(|s| !s.is_empty()).ok_or(TokenError::NotConfigured)?;
    let presented = extract_bearer_token(headers)?;

    if constant_time_eq::constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(TokenError::Mismatch)
    }
}

fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(TokenError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(TokenError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// Token extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header not present
    Missing,
    /// Not "Bearer <token>"
    InvalidFormat,
    /// Token is empty string
    Empty,
    /// Token does not match the shared secret
    Mismatch,
    /// Token is not registered to any user
    Unknown,
    /// No shared secret configured
    NotConfigured,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "Authorization token not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid authorization token format"),
            TokenError::Empty => write!(f, "Authorization token is empty"),
            TokenError::Mismatch => write!(f, "Authorization token rejected"),
            TokenError::Unknown => write!(f, "Authorization token not recognized"),
            TokenError::NotConfigured => write!(f, "Endpoint is not configured"),
        }
    }
}

impl std::error::Error for TokenError {}
