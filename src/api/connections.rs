//! Connection API endpoints.
//!
//! - `GET /api/providers`: installable providers
//! - `POST /api/connections/install`: start an install
//! - `POST /api/connections/api-key`: connect an API-key provider
//! - `GET /api/connections`: the caller's connections with health
//! - `DELETE /api/connections/:id`: revoke
//! - `PUT /api/connections/:id/sync`: toggle syncing

use super::{ApiError, ConnectionAppState};
use crate::connection::{evaluate, Connection, ConnectionStatus, HealthReport};
use crate::manager::{InstallOptions, InstallOutcome};
use crate::rate_limit::RequestKind;
use crate::provider::{AuthType, Provider};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Create connection API router
pub fn create_connection_router(state: ConnectionAppState) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/connections", get(list_connections))
        .route("/api/connections/install", post(install))
        .route("/api/connections/api-key", post(configure_api_key))
        .route("/api/connections/:id", delete(revoke))
        .route("/api/connections/:id/sync", put(set_sync))
        .with_state(Arc::new(state))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderSummary {
    id: String,
    name: String,
    auth_type: AuthType,
    icon: String,
    category: String,
    scopes: Vec<String>,
}

#[derive(Serialize)]
struct ListProvidersResponse {
    providers: Vec<ProviderSummary>,
    count: usize,
}

/// A connection as shown to its owner. Never carries credentials.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    pub icon: String,
    pub account_email: Option<String>,
    pub status: ConnectionStatus,
    pub sync_enabled: bool,
    pub connected_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub health: HealthReport,
}

impl ConnectionView {
    pub fn new(connection: &Connection, provider: Option<&Provider>) -> Self {
        Self {
            id: connection.id.clone(),
            provider_id: connection.provider_id.clone(),
            name: provider
                .map(|p| p.name.clone())
                .unwrap_or_else(|| connection.provider_id.clone()),
            icon: provider.map(|p| p.display.icon.clone()).unwrap_or_default(),
            account_email: connection.account_email.clone(),
            status: connection.status,
            sync_enabled: connection.sync_enabled,
            connected_at: connection.created_at,
            last_synced_at: connection.last_synced_at,
            error: connection.error_message.clone(),
            health: evaluate(connection),
        }
    }
}

#[derive(Serialize)]
struct ListConnectionsResponse {
    connections: Vec<ConnectionView>,
    count: usize,
}

#[derive(Serialize)]
struct ConnectionResponse {
    connection: ConnectionView,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    authorization_url: String,
    state: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RevokeResponse {
    success: bool,
}

/// Request body for POST /api/connections/install
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub provider_id: String,
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub source: Option<String>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

/// Request body for POST /api/connections/api-key
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRequest {
    pub provider_id: String,
    pub api_key: String,
    pub api_secret: Option<String>,
}

#[derive(Deserialize)]
pub struct SyncRequest {
    pub enabled: bool,
}

impl ConnectionAppState {
    fn view(&self, connection: &Connection) -> ConnectionView {
        ConnectionView::new(connection, self.manager.registry().get(&connection.provider_id))
    }
}

async fn list_providers(State(state): State<Arc<ConnectionAppState>>) -> Json<ListProvidersResponse> {
    let providers: Vec<ProviderSummary> = state
        .manager
        .registry()
        .list()
        .map(|p| ProviderSummary {
            id: p.id.clone(),
            name: p.name.clone(),
            auth_type: p.auth_type,
            icon: p.display.icon.clone(),
            category: p.display.category.clone(),
            scopes: p.scopes.clone(),
        })
        .collect();

    Json(ListProvidersResponse {
        count: providers.len(),
        providers,
    })
}

async fn list_connections(
    State(state): State<Arc<ConnectionAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListConnectionsResponse>, ApiError> {
    let user_id = state.user(&headers)?;
    debug!(user_id = %user_id, "Listing connections");

    let connections: Vec<ConnectionView> = state
        .manager
        .get_user_connections(&user_id)?
        .iter()
        .map(|c| state.view(c))
        .collect();

    Ok(Json(ListConnectionsResponse {
        count: connections.len(),
        connections,
    }))
}

async fn install(
    State(state): State<Arc<ConnectionAppState>>,
    headers: HeaderMap,
    Json(body): Json<InstallRequest>,
) -> Result<Response, ApiError> {
    let user_id = state.user(&headers)?;
    state.check_rate_limit(&user_id, RequestKind::Install)?;

    let options = InstallOptions {
        redirect_uri: body.redirect_uri,
        metadata: body.metadata,
        source: body.source,
        api_key: body.api_key,
        api_secret: body.api_secret,
    };

    let response = match state
        .manager
        .install_connection(&user_id, &body.provider_id, options)
        .await?
    {
        InstallOutcome::Authorize {
            authorization_url,
            state: csrf_state,
            expires_at,
        } => Json(AuthorizeResponse {
            authorization_url,
            state: csrf_state,
            expires_at,
        })
        .into_response(),
        InstallOutcome::Connected(connection) => Json(ConnectionResponse {
            connection: state.view(&connection),
        })
        .into_response(),
    };
    Ok(response)
}

async fn configure_api_key(
    State(state): State<Arc<ConnectionAppState>>,
    headers: HeaderMap,
    Json(body): Json<ApiKeyRequest>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let user_id = state.user(&headers)?;
    state.check_rate_limit(&user_id, RequestKind::ApiKey)?;

    let connection = state
        .manager
        .configure_api_key(
            &user_id,
            &body.provider_id,
            &body.api_key,
            body.api_secret.as_deref(),
        )
        .await?;

    Ok(Json(ConnectionResponse {
        connection: state.view(&connection),
    }))
}

async fn revoke(
    State(state): State<Arc<ConnectionAppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RevokeResponse>, ApiError> {
    let user_id = state.user(&headers)?;
    state.manager.revoke_connection(&user_id, &id)?;
    Ok(Json(RevokeResponse { success: true }))
}

async fn set_sync(
    State(state): State<Arc<ConnectionAppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<SyncRequest>,
) -> Result<Json<ConnectionResponse>, ApiError> {
    let user_id = state.user(&headers)?;
    let connection = state.manager.set_sync_enabled(&user_id, &id, body.enabled)?;

    info!(
        user_id = %user_id,
        connection_id = %id,
        enabled = body.enabled,
        "Sync setting changed"
    );

    Ok(Json(ConnectionResponse {
        connection: state.view(&connection),
    }))
}
