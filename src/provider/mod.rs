//! Provider definitions and adapters.
//!
//! A [`Provider`] is an immutable description of an external service (how it
//! authenticates, which endpoints it exposes, what install metadata it
//! accepts). The network side lives behind [`ProviderAdapter`].

mod adapter;
pub mod catalog;
pub mod http;
mod registry;

pub use adapter::{call_with_timeout, ProviderAdapter, TokenGrant, TokenSet};
pub use registry::ProviderRegistry;

use crate::connection::ConnectionMetadata;
use crate::error::ConnectionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How a provider authenticates users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    #[serde(rename = "oauth2")]
    OAuth2,
    #[serde(rename = "apikey")]
    ApiKey,
}

impl AuthType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthType::OAuth2 => "oauth2",
            AuthType::ApiKey => "apikey",
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oauth2" => Ok(AuthType::OAuth2),
            "apikey" => Ok(AuthType::ApiKey),
            other => Err(anyhow::anyhow!("Unknown auth type '{}'", other)),
        }
    }
}

/// Provider endpoint URLs. Which ones are set depends on [`AuthType`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEndpoints {
    pub authorize_url: Option<String>,
    pub token_url: Option<String>,
    /// Falls back to `token_url` when unset.
    pub refresh_url: Option<String>,
    pub profile_url: Option<String>,
    pub validation_url: Option<String>,
}

impl ProviderEndpoints {
    pub fn refresh_url(&self) -> Option<&str> {
        self.refresh_url.as_deref().or(self.token_url.as_deref())
    }
}

/// Presentation fields shown in the connection picker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDisplay {
    pub icon: String,
    pub category: String,
    pub description: String,
}

/// One allowed install-metadata key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataField {
    pub key: String,
    #[serde(default)]
    pub required: bool,
}

impl MetadataField {
    pub fn optional(key: &str) -> Self {
        Self {
            key: key.to_string(),
            required: false,
        }
    }

    pub fn required(key: &str) -> Self {
        Self {
            key: key.to_string(),
            required: true,
        }
    }
}

/// Keys a provider accepts as install metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataSchema {
    pub fields: Vec<MetadataField>,
}

impl MetadataSchema {
    /// Rejects unknown keys and missing required keys.
    pub fn validate(
        &self,
        entries: BTreeMap<String, String>,
    ) -> Result<ConnectionMetadata, ConnectionError> {
        if let Some(unknown) = entries
            .keys()
            .find(|key| !self.fields.iter().any(|f| &f.key == *key))
        {
            return Err(ConnectionError::InvalidRequest(format!(
                "unknown metadata key '{}'",
                unknown
            )));
        }

        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| f.required && !entries.contains_key(&f.key))
        {
            return Err(ConnectionError::InvalidRequest(format!(
                "missing required metadata key '{}'",
                missing.key
            )));
        }

        Ok(ConnectionMetadata::from_validated(entries))
    }
}

/// JSON field names used to read identity out of a profile response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMapping {
    pub account_id_field: Option<String>,
    pub account_email_field: Option<String>,
}

impl Default for ProfileMapping {
    fn default() -> Self {
        Self {
            account_id_field: Some("id".to_string()),
            account_email_field: Some("email".to_string()),
        }
    }
}

/// Immutable definition of an external service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub auth_type: AuthType,
    pub scopes: Vec<String>,
    pub endpoints: ProviderEndpoints,
    pub display: ProviderDisplay,
    #[serde(default)]
    pub metadata_schema: MetadataSchema,
    #[serde(default)]
    pub profile_mapping: ProfileMapping,
}

/// Identity a provider reports for an account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountProfile {
    pub account_id: Option<String>,
    pub account_email: Option<String>,
    pub granted_scopes: Vec<String>,
}
