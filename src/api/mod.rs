// HTTP edges around the connection manager

mod connections;
mod cron;
mod oauth;

pub use connections::{create_connection_router, ConnectionView};
pub use cron::{create_cron_router, CronAppState};
pub use oauth::create_oauth_router;

use crate::auth::{TokenError, UserResolver};
use crate::error::ConnectionError;
use crate::manager::ConnectionManager;
use crate::rate_limit::{RateLimiter, RequestKind};
use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::error;

/// Shared state for the connection and OAuth routers
#[derive(Clone)]
pub struct ConnectionAppState {
    pub manager: Arc<ConnectionManager>,
    pub users: Arc<dyn UserResolver>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl ConnectionAppState {
    fn user(&self, headers: &HeaderMap) -> Result<String, ApiError> {
        self.users.resolve(headers).map_err(ApiError::Unauthorized)
    }

    fn check_rate_limit(&self, user_id: &str, kind: RequestKind) -> Result<(), ApiError> {
        self.rate_limiter.admit(user_id, kind).map_err(|throttled| {
            ConnectionError::RateLimited {
                retry_after_seconds: Some(throttled.retry_after_seconds()),
            }
            .into()
        })
    }
}

/// Full API: connections, OAuth callback and the cron trigger.
pub fn create_router(connections: ConnectionAppState, cron: CronAppState) -> Router {
    Router::new()
        .merge(create_connection_router(connections.clone()))
        .merge(create_oauth_router(connections))
        .merge(create_cron_router(cron))
}

/// Error body shared by every JSON endpoint
#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
}

/// Application error types
enum ApiError {
    Unauthorized(TokenError),
    Connection(ConnectionError),
}

impl From<ConnectionError> for ApiError {
    fn from(e: ConnectionError) -> Self {
        ApiError::Connection(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = match &self {
            ApiError::Connection(ConnectionError::RateLimited {
                retry_after_seconds: Some(secs),
            }) => Some(HeaderValue::from(*secs)),
            _ => None,
        };

        let (status, error, code) = match self {
            ApiError::Unauthorized(e) => (StatusCode::UNAUTHORIZED, e.to_string(), "UNAUTHORIZED"),
            ApiError::Connection(e) => {
                if e.status_code().is_server_error() && !matches!(e, ConnectionError::TransientError(_)) {
                    error!(error = %e, code = e.code(), "Request failed");
                }
                (e.status_code(), e.to_string(), e.code())
            }
        };

        let body = Json(ErrorResponse {
            success: false,
            error,
            code,
        });

        let mut response = (status, body).into_response();
        if let Some(value) = retry_after {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}
