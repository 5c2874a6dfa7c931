//! Generic HTTP adapters used by the built-in catalog.
//!
//! [`HttpOAuth2Adapter`] speaks the standard authorization-code grant with
//! form-encoded token requests. [`HttpApiKeyAdapter`] validates a key by
//! calling an authenticated endpoint. Both classify every failure into an
//! [`AdapterError`].

use super::{AccountProfile, ProfileMapping, Provider, ProviderAdapter, TokenGrant, TokenSet};
use crate::error::AdapterError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::{header, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

/// OAuth error codes that mean the grant itself is dead.
const FATAL_GRANT_ERRORS: [&str; 3] = ["invalid_grant", "unauthorized_client", "invalid_client"];

/// OAuth client registration for one provider.
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .finish()
    }
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize, Debug)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Space or comma separated
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    /// Fails when `expires_in` does not fit a timestamp.
    fn into_token_set(self) -> Result<(TokenSet, Option<Vec<String>>), AdapterError> {
        let expires_at = match self.expires_in {
            None => None,
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        AdapterError::Transient(format!("invalid expires_in: {}", secs))
                    })?,
            ),
        };
        let scopes = self.scope.map(|s| {
            s.split(|c: char| c == ' ' || c == ',')
                .filter(|scope| !scope.is_empty())
                .map(str::to_string)
                .collect()
        });
        let tokens = TokenSet {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        };
        Ok((tokens, scopes))
    }
}

#[derive(Deserialize, Default)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
}

fn retry_after(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn send_failure(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Transient("provider request timed out".to_string())
    } else {
        AdapterError::Transient(format!("provider request failed: {}", e))
    }
}

/// Classifies a non-2xx response from a token endpoint.
///
/// 400 with a fatal grant error, 401 and 403 mean the grant is dead. Anything
/// else may succeed later.
async fn token_endpoint_failure(response: Response) -> AdapterError {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AdapterError::RateLimited {
            retry_after_seconds: retry_after(&response),
        };
    }
    if status.is_server_error() {
        return AdapterError::Transient(format!("token endpoint returned {}", status));
    }

    let body = response.text().await.unwrap_or_default();
    let error_code = serde_json::from_str::<OAuthErrorBody>(&body)
        .ok()
        .and_then(|b| b.error)
        .or_else(|| {
            serde_urlencoded::from_str::<HashMap<String, String>>(&body)
                .ok()
                .and_then(|mut form| form.remove("error"))
        });

    match (status, error_code) {
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, code) => {
            AdapterError::Auth(code.unwrap_or_else(|| status.to_string()))
        }
        (StatusCode::BAD_REQUEST, Some(code)) if FATAL_GRANT_ERRORS.contains(&code.as_str()) => {
            AdapterError::Auth(code)
        }
        (_, code) => AdapterError::Transient(format!(
            "token endpoint returned {} ({})",
            status,
            code.as_deref().unwrap_or("no error code")
        )),
    }
}

/// Reads account identity out of a JSON profile using `mapping`.
fn map_profile(body: &Value, mapping: &ProfileMapping) -> AccountProfile {
    let field = |name: &Option<String>| {
        name.as_deref()
            .and_then(|n| body.get(n))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    };

    AccountProfile {
        account_id: field(&mapping.account_id_field),
        account_email: field(&mapping.account_email_field),
        granted_scopes: Vec::new(),
    }
}

/// Authorization-code OAuth2 adapter driven by [`Provider`] endpoints.
pub struct HttpOAuth2Adapter {
    client: reqwest::Client,
    credentials: ClientCredentials,
    authorize_url: String,
    token_url: String,
    refresh_url: String,
    profile_url: Option<String>,
    mapping: ProfileMapping,
    default_scopes: Vec<String>,
    extra_authorize_params: Vec<(String, String)>,
}

impl HttpOAuth2Adapter {
    pub fn new(
        provider: &Provider,
        credentials: ClientCredentials,
        client: reqwest::Client,
    ) -> Result<Self> {
        let endpoints = &provider.endpoints;
        let authorize_url = endpoints
            .authorize_url
            .clone()
            .ok_or_else(|| anyhow!("Provider '{}' has no authorize URL", provider.id))?;
        let token_url = endpoints
            .token_url
            .clone()
            .ok_or_else(|| anyhow!("Provider '{}' has no token URL", provider.id))?;
        let refresh_url = endpoints
            .refresh_url()
            .map(str::to_string)
            .unwrap_or_else(|| token_url.clone());

        Ok(Self {
            client,
            credentials,
            authorize_url,
            token_url,
            refresh_url,
            profile_url: endpoints.profile_url.clone(),
            mapping: provider.profile_mapping.clone(),
            default_scopes: provider.scopes.clone(),
            extra_authorize_params: Vec::new(),
        })
    }

    /// Adds a fixed query parameter to every authorization URL
    /// (e.g. `access_type=offline`).
    pub fn with_authorize_param(mut self, key: &str, value: &str) -> Self {
        self.extra_authorize_params
            .push((key.to_string(), value.to_string()));
        self
    }

    async fn post_token_form(&self, url: &str, form: &[(&str, &str)]) -> Result<TokenResponse, AdapterError> {
        let response = self
            .client
            .post(url)
            .header(header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await
            .map_err(send_failure)?;

        if !response.status().is_success() {
            return Err(token_endpoint_failure(response).await);
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| AdapterError::Transient(format!("malformed token response: {}", e)))
    }

    async fn get_profile(&self, url: &str, access_token: &str) -> Result<Value, AdapterError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(access_token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(send_failure)?;
        if !response.status().is_success() {
            return Err(AdapterError::Transient(format!(
                "profile endpoint returned {}",
                response.status()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::Transient(format!("malformed profile: {}", e)))
    }

    /// Best effort: a failing profile endpoint yields an empty profile.
    async fn fetch_profile(&self, access_token: &str) -> AccountProfile {
        let Some(url) = &self.profile_url else {
            return AccountProfile::default();
        };

        match self.get_profile(url, access_token).await {
            Ok(body) => map_profile(&body, &self.mapping),
            Err(e) => {
                warn!(error = %e, "Profile lookup failed, continuing without identity");
                AccountProfile::default()
            }
        }
    }
}

#[async_trait]
impl ProviderAdapter for HttpOAuth2Adapter {
    fn build_authorize_url(
        &self,
        state: &str,
        redirect_uri: &str,
        scopes: &[String],
    ) -> Result<String, AdapterError> {
        let scopes = scopes.join(" ");
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
            self.authorize_url,
            urlencoding::encode(&self.credentials.client_id),
            urlencoding::encode(redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        );
        for (key, value) in &self.extra_authorize_params {
            url.push_str(&format!(
                "&{}={}",
                urlencoding::encode(key),
                urlencoding::encode(value)
            ));
        }
        Ok(url)
    }

    async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenGrant, AdapterError> {
        debug!("Exchanging authorization code for token at {}", self.token_url);

        let response = self
            .post_token_form(
                &self.token_url,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", self.credentials.client_id.as_str()),
                    ("client_secret", self.credentials.client_secret.as_str()),
                ],
            )
            .await?;

        let (tokens, scopes) = response.into_token_set()?;
        debug!(
            has_refresh_token = tokens.refresh_token.is_some(),
            "Token exchange successful"
        );

        let mut profile = self.fetch_profile(&tokens.access_token).await;
        profile.granted_scopes = scopes.unwrap_or_else(|| self.default_scopes.clone());

        Ok(TokenGrant { tokens, profile })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, AdapterError> {
        let response = self
            .post_token_form(
                &self.refresh_url,
                &[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", refresh_token),
                    ("client_id", self.credentials.client_id.as_str()),
                    ("client_secret", self.credentials.client_secret.as_str()),
                ],
            )
            .await?;

        Ok(response.into_token_set()?.0)
    }
}

/// Where an API key (and secret) travel on the validation request.
#[derive(Clone, Debug, PartialEq)]
pub enum ApiKeyPlacement {
    /// Custom headers, e.g. `APCA-API-KEY-ID` / `APCA-API-SECRET-KEY`.
    Headers {
        key_header: String,
        secret_header: Option<String>,
    },
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `?<param>=<key>`
    Query { param: String },
}

/// Validates API keys by calling an authenticated endpoint.
pub struct HttpApiKeyAdapter {
    client: reqwest::Client,
    validation_url: String,
    placement: ApiKeyPlacement,
    mapping: ProfileMapping,
}

impl HttpApiKeyAdapter {
    pub fn new(provider: &Provider, placement: ApiKeyPlacement, client: reqwest::Client) -> Result<Self> {
        let validation_url = provider
            .endpoints
            .validation_url
            .clone()
            .ok_or_else(|| anyhow!("Provider '{}' has no validation URL", provider.id))?;

        Ok(Self {
            client,
            validation_url,
            placement,
            mapping: provider.profile_mapping.clone(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for HttpApiKeyAdapter {
    async fn validate_api_key(
        &self,
        api_key: &str,
        api_secret: Option<&str>,
    ) -> Result<AccountProfile, AdapterError> {
        let mut request = self
            .client
            .get(&self.validation_url)
            .header(header::ACCEPT, "application/json");

        request = match &self.placement {
            ApiKeyPlacement::Headers {
                key_header,
                secret_header,
            } => {
                let request = request.header(key_header.as_str(), api_key);
                match (secret_header, api_secret) {
                    (Some(name), Some(secret)) => request.header(name.as_str(), secret),
                    (Some(_), None) => {
                        return Err(AdapterError::InvalidCredentials(
                            "API secret is required".to_string(),
                        ))
                    }
                    (None, _) => request,
                }
            }
            ApiKeyPlacement::Bearer => request.bearer_auth(api_key),
            ApiKeyPlacement::Query { param } => request.query(&[(param.as_str(), api_key)]),
        };

        let response = request.send().await.map_err(send_failure)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AdapterError::RateLimited {
                retry_after_seconds: retry_after(&response),
            });
        }
        if status.is_server_error() {
            return Err(AdapterError::Transient(format!(
                "validation endpoint returned {}",
                status
            )));
        }
        if status.is_client_error() {
            return Err(AdapterError::InvalidCredentials(format!(
                "provider rejected the key ({})",
                status
            )));
        }

        // A non-JSON success still proves the key works
        let profile = match response.json::<Value>().await {
            Ok(body) => map_profile(&body, &self.mapping),
            Err(_) => AccountProfile::default(),
        };
        Ok(profile)
    }
}
