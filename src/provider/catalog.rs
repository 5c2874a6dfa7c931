//! Built-in provider catalog.
//!
//! OAuth2 providers need client credentials from the environment:
//! - `SWITCHBOARD_OAUTH_<ID>_CLIENT_ID`
//! - `SWITCHBOARD_OAUTH_<ID>_CLIENT_SECRET`
//!
//! where `<ID>` is the provider id upper-cased with `-` replaced by `_`.
//! Providers without credentials are left out of the registry.

use super::http::{ApiKeyPlacement, ClientCredentials, HttpApiKeyAdapter, HttpOAuth2Adapter};
use super::{
    AuthType, MetadataField, MetadataSchema, ProfileMapping, Provider, ProviderDisplay,
    ProviderEndpoints, ProviderRegistry,
};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn display(icon: &str, category: &str, description: &str) -> ProviderDisplay {
    ProviderDisplay {
        icon: icon.to_string(),
        category: category.to_string(),
        description: description.to_string(),
    }
}

fn mapping(id_field: Option<&str>, email_field: Option<&str>) -> ProfileMapping {
    ProfileMapping {
        account_id_field: id_field.map(str::to_string),
        account_email_field: email_field.map(str::to_string),
    }
}

pub fn alpaca() -> Provider {
    Provider {
        id: "alpaca".to_string(),
        name: "Alpaca".to_string(),
        auth_type: AuthType::OAuth2,
        scopes: strings(&["account:write", "trading", "data"]),
        endpoints: ProviderEndpoints {
            authorize_url: Some("https://app.alpaca.markets/oauth/authorize".to_string()),
            token_url: Some("https://api.alpaca.markets/oauth/token".to_string()),
            refresh_url: None,
            profile_url: Some("https://api.alpaca.markets/v2/account".to_string()),
            validation_url: None,
        },
        display: display("alpaca", "brokerage", "Commission-free stock and crypto trading"),
        metadata_schema: MetadataSchema {
            fields: vec![MetadataField::optional("environment")],
        },
        profile_mapping: mapping(Some("account_number"), None),
    }
}

pub fn google_calendar() -> Provider {
    Provider {
        id: "google-calendar".to_string(),
        name: "Google Calendar".to_string(),
        auth_type: AuthType::OAuth2,
        scopes: strings(&[
            "openid",
            "email",
            "https://www.googleapis.com/auth/calendar.readonly",
        ]),
        endpoints: ProviderEndpoints {
            authorize_url: Some("https://accounts.google.com/o/oauth2/v2/auth".to_string()),
            token_url: Some("https://oauth2.googleapis.com/token".to_string()),
            refresh_url: None,
            profile_url: Some("https://openidconnect.googleapis.com/v1/userinfo".to_string()),
            validation_url: None,
        },
        display: display("google-calendar", "calendar", "Events from your Google calendars"),
        metadata_schema: MetadataSchema {
            fields: vec![MetadataField::optional("calendar_id")],
        },
        profile_mapping: mapping(Some("sub"), Some("email")),
    }
}

pub fn outlook_calendar() -> Provider {
    Provider {
        id: "outlook-calendar".to_string(),
        name: "Outlook Calendar".to_string(),
        auth_type: AuthType::OAuth2,
        scopes: strings(&["offline_access", "User.Read", "Calendars.Read"]),
        endpoints: ProviderEndpoints {
            authorize_url: Some(
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize".to_string(),
            ),
            token_url: Some("https://login.microsoftonline.com/common/oauth2/v2.0/token".to_string()),
            refresh_url: None,
            profile_url: Some("https://graph.microsoft.com/v1.0/me".to_string()),
            validation_url: None,
        },
        display: display("outlook", "calendar", "Events from Microsoft 365 and Outlook.com"),
        metadata_schema: MetadataSchema::default(),
        profile_mapping: mapping(Some("id"), Some("mail")),
    }
}

pub fn polygon() -> Provider {
    Provider {
        id: "polygon".to_string(),
        name: "Polygon.io".to_string(),
        auth_type: AuthType::ApiKey,
        scopes: Vec::new(),
        endpoints: ProviderEndpoints {
            validation_url: Some("https://api.polygon.io/v3/reference/tickers?limit=1".to_string()),
            ..Default::default()
        },
        display: display("polygon", "market-data", "Real-time and historical market data"),
        metadata_schema: MetadataSchema::default(),
        profile_mapping: mapping(None, None),
    }
}

pub fn finnhub() -> Provider {
    Provider {
        id: "finnhub".to_string(),
        name: "Finnhub".to_string(),
        auth_type: AuthType::ApiKey,
        scopes: Vec::new(),
        endpoints: ProviderEndpoints {
            validation_url: Some("https://finnhub.io/api/v1/quote?symbol=AAPL".to_string()),
            ..Default::default()
        },
        display: display("finnhub", "market-data", "Stock quotes, fundamentals and news"),
        metadata_schema: MetadataSchema::default(),
        profile_mapping: mapping(None, None),
    }
}

/// Environment variable holding a provider's OAuth client id or secret.
pub fn client_env_var(provider_id: &str, suffix: &str) -> String {
    format!(
        "SWITCHBOARD_OAUTH_{}_{}",
        provider_id.to_uppercase().replace('-', "_"),
        suffix
    )
}

fn client_credentials<F>(provider_id: &str, lookup: &F) -> Option<ClientCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    let client_id = lookup(&client_env_var(provider_id, "CLIENT_ID"))?;
    let client_secret = lookup(&client_env_var(provider_id, "CLIENT_SECRET"))?;
    Some(ClientCredentials {
        client_id,
        client_secret,
    })
}

/// Builds a registry with every built-in provider that can be served.
///
/// `lookup` resolves environment variables (`std::env::var` in production).
pub fn builtin_registry<F>(lookup: F) -> Result<ProviderRegistry>
where
    F: Fn(&str) -> Option<String>,
{
    let client = reqwest::Client::builder()
        .user_agent(concat!("switchboard/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;

    let mut registry = ProviderRegistry::new();

    for provider in [alpaca(), google_calendar(), outlook_calendar()] {
        let Some(credentials) = client_credentials(&provider.id, &lookup) else {
            warn!(
                provider = %provider.id,
                "OAuth client credentials not configured, provider disabled"
            );
            continue;
        };

        let mut adapter = HttpOAuth2Adapter::new(&provider, credentials, client.clone())?;
        if provider.id == "google-calendar" {
            // Google only issues refresh tokens for offline access with consent
            adapter = adapter
                .with_authorize_param("access_type", "offline")
                .with_authorize_param("prompt", "consent");
        }
        registry.register(provider, Arc::new(adapter));
    }

    let polygon = polygon();
    let adapter = HttpApiKeyAdapter::new(
        &polygon,
        ApiKeyPlacement::Query {
            param: "apiKey".to_string(),
        },
        client.clone(),
    )?;
    registry.register(polygon, Arc::new(adapter));

    let finnhub = finnhub();
    let adapter = HttpApiKeyAdapter::new(
        &finnhub,
        ApiKeyPlacement::Headers {
            key_header: "X-Finnhub-Token".to_string(),
            secret_header: None,
        },
        client,
    )?;
    registry.register(finnhub, Arc::new(adapter));

    info!(providers = registry.len(), "Provider registry built");
    Ok(registry)
}
