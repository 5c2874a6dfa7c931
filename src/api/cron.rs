//! Scheduled token refresh trigger.
//!
//! `POST /api/cron/refresh-tokens` (GET also accepted for cron services that
//! only issue GETs). The shared secret is checked before anything else runs.

use crate::auth::verify_shared_secret;
use crate::scheduler::{JobSummary, TokenRefreshScheduler};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

/// Shared state for the cron router
#[derive(Clone)]
pub struct CronAppState {
    pub scheduler: Arc<TokenRefreshScheduler>,
    /// Bearer secret expected from the trigger. `None` rejects every call.
    pub cron_secret: Option<String>,
}

#[derive(Serialize)]
struct CronSuccess {
    success: bool,
    message: String,
    timestamp: DateTime<Utc>,
    summary: JobSummary,
}

#[derive(Serialize)]
struct CronFailure {
    success: bool,
    error: String,
    timestamp: DateTime<Utc>,
}

/// Create cron API router
pub fn create_cron_router(state: CronAppState) -> Router {
    Router::new()
        .route(
            "/api/cron/refresh-tokens",
            get(refresh_tokens).post(refresh_tokens),
        )
        .with_state(Arc::new(state))
}

fn failure(status: StatusCode, error: String) -> Response {
    let body = Json(CronFailure {
        success: false,
        error,
        timestamp: Utc::now(),
    });
    (status, body).into_response()
}

async fn refresh_tokens(State(state): State<Arc<CronAppState>>, headers: HeaderMap) -> Response {
    if let Err(e) = verify_shared_secret(&headers, state.cron_secret.as_deref()) {
        warn!(reason = %e, "Rejected cron trigger");
        return failure(StatusCode::UNAUTHORIZED, "Unauthorized".to_string());
    }

    match state.scheduler.run().await {
        Ok(summary) => Json(CronSuccess {
            success: true,
            message: format!(
                "Refreshed {} of {} due connections",
                summary.refreshed, summary.candidates
            ),
            timestamp: Utc::now(),
            summary,
        })
        .into_response(),
        Err(e) => {
            error!(error = %format!("{:#}", e), "Token refresh job failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
        }
    }
}
