//! OAuth 2.0 callback endpoint.
//!
//! The provider redirects the browser here after the user authorizes:
//! 1. `POST /api/connections/install` issued a state and authorization URL
//! 2. User authorizes on the provider's site
//! 3. Provider redirects to `GET /api/connections/oauth/callback?code&state`
//! 4. The manager consumes the state and exchanges the code
//! 5. Browser is sent back to the app with `success=connected` or `error=<code>`

use super::ConnectionAppState;
use axum::{
    extract::{Query, State},
    response::Redirect,
    routing::get,
    Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Path the provider redirects to. Must match `OAuthConfig::callback_url`.
pub const CALLBACK_PATH: &str = "/api/connections/oauth/callback";

/// OAuth callback query parameters
#[derive(Deserialize, Debug)]
pub struct OAuthCallback {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Create OAuth API router
pub fn create_oauth_router(state: ConnectionAppState) -> Router {
    Router::new()
        .route(CALLBACK_PATH, get(oauth_callback))
        .with_state(Arc::new(state))
}

/// GET /api/connections/oauth/callback
///
/// Always answers with a 303 redirect; failures travel as `error=<code>`.
async fn oauth_callback(
    State(state): State<Arc<ConnectionAppState>>,
    Query(callback): Query<OAuthCallback>,
) -> Redirect {
    let return_url = state.manager.return_url_for(callback.state.as_deref());
    debug!(has_state = callback.state.is_some(), "OAuth callback received");

    if let Some(error) = callback.error {
        warn!(
            error = %error,
            description = callback.error_description.as_deref().unwrap_or("none"),
            "OAuth authorization failed at provider"
        );
        return Redirect::to(&with_query(&return_url, "error", &error));
    }

    let (Some(code), Some(csrf_state)) = (callback.code, callback.state) else {
        warn!("OAuth callback missing code or state");
        return Redirect::to(&with_query(&return_url, "error", "INVALID_REQUEST"));
    };

    match state.manager.handle_oauth_callback(&code, &csrf_state).await {
        Ok(connection) => {
            info!(
                user_id = %connection.user_id,
                provider = %connection.provider_id,
                "OAuth flow completed"
            );
            let url = with_query(&return_url, "success", "connected");
            Redirect::to(&with_query(&url, "provider", &connection.provider_id))
        }
        Err(e) => {
            warn!(error = %e, code = e.code(), "OAuth callback rejected");
            Redirect::to(&with_query(&return_url, "error", e.code()))
        }
    }
}

fn with_query(url: &str, key: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}{}={}",
        url,
        separator,
        key,
        urlencoding::encode(value)
    )
}
