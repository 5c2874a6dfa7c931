// Integration tests for the connection API

mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{body_json, create_test_app, json_request, AppOptions, ALICE_TOKEN, BOB_TOKEN};
use serde_json::json;
use tower::ServiceExt;

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_list_providers() {
    let app = create_test_app(AppOptions::default());

    let response = app.router.oneshot(get("/api/providers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["count"], 2);
    assert_eq!(json["providers"][0]["id"], "alpaca");
    assert_eq!(json["providers"][0]["authType"], "oauth2");
    assert_eq!(json["providers"][1]["id"], "polygon");
    assert_eq!(json["providers"][1]["authType"], "apikey");
}

#[tokio::test]
async fn test_install_oauth_provider_returns_authorization_url() {
    let app = create_test_app(AppOptions::default());

    let response = app
        .router
        .oneshot(json_request(
            "POST",
            "/api/connections/install",
            json!({ "providerId": "alpaca", "source": "settings" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let url = json["authorizationUrl"].as_str().unwrap();
    let state = json["state"].as_str().unwrap();
    assert!(url.starts_with("https://provider.test/authorize"));
    assert!(url.contains(state));
    assert!(json["expiresAt"].is_string());
}

#[tokio::test]
async fn test_install_unknown_provider() {
    let app = create_test_app(AppOptions::default());

    let response = app
        .router
        .oneshot(json_request(
            "POST",
            "/api/connections/install",
            json!({ "providerId": "unknown-provider" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["success"], false);
    assert_eq!(json["code"], "PROVIDER_NOT_FOUND");
    assert_eq!(app.store.state_count(), 0);
}

#[tokio::test]
async fn test_install_apikey_provider_without_key() {
    let app = create_test_app(AppOptions::default());

    let response = app
        .router
        .oneshot(json_request(
            "POST",
            "/api/connections/install",
            json!({ "providerId": "polygon" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "UNSUPPORTED_AUTH_TYPE");
}

#[tokio::test]
async fn test_configure_api_key_then_list() {
    let app = create_test_app(AppOptions::default());

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/connections/api-key",
            json!({ "providerId": "polygon", "apiKey": "good-key" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["connection"]["status"], "ACTIVE");
    assert_eq!(json["connection"]["providerId"], "polygon");
    assert!(json["connection"].get("credentials").is_none());

    let response = app.router.oneshot(get("/api/connections")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["count"], 1);
    let connection = &json["connections"][0];
    assert_eq!(connection["name"], "Polygon.io");
    assert_eq!(connection["health"]["isHealthy"], true);
    assert_eq!(connection["health"]["canSync"], true);
}

#[tokio::test]
async fn test_rejected_api_key() {
    let app = create_test_app(AppOptions::default());

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/connections/api-key",
            json!({ "providerId": "polygon", "apiKey": "wrong-key" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "INVALID_CREDENTIALS");

    let response = app.router.oneshot(get("/api/connections")).await.unwrap();
    assert_eq!(body_json(response).await["count"], 0);
}

#[tokio::test]
async fn test_revoke_and_toggle_sync() {
    let app = create_test_app(AppOptions::default());
    let connection = app
        .manager
        .configure_api_key("default", "polygon", "good-key", None)
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(json_request(
            "PUT",
            &format!("/api/connections/{}/sync", connection.id),
            json!({ "enabled": false }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["connection"]["syncEnabled"], false);

    let response = app
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/connections/{}", connection.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);

    let response = app.router.oneshot(get("/api/connections")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["connections"][0]["status"], "REVOKED");
    assert_eq!(json["connections"][0]["health"]["needsReauth"], true);
}

#[tokio::test]
async fn test_revoke_unknown_connection() {
    let app = create_test_app(AppOptions::default());

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/connections/does-not-exist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "CONNECTION_NOT_FOUND");
}

#[tokio::test]
async fn test_auth_enabled_scopes_connections_to_token() {
    let app = create_test_app(AppOptions {
        auth_enabled: true,
        ..Default::default()
    });
    app.manager
        .configure_api_key("alice", "polygon", "good-key", None)
        .await
        .unwrap();

    let response = app
        .router
        .clone()
        .oneshot(get("/api/connections"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    let with_token = |token: &str| {
        Request::builder()
            .uri("/api/connections")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.router.clone().oneshot(with_token(ALICE_TOKEN)).await.unwrap();
    assert_eq!(body_json(response).await["count"], 1);

    let response = app.router.clone().oneshot(with_token(BOB_TOKEN)).await.unwrap();
    assert_eq!(body_json(response).await["count"], 0);

    // A user id is not a credential
    let response = app.router.oneshot(with_token("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_user_id_as_token_cannot_revoke() {
    let app = create_test_app(AppOptions {
        auth_enabled: true,
        ..Default::default()
    });
    let connection = app
        .manager
        .configure_api_key("alice", "polygon", "good-key", None)
        .await
        .unwrap();

    let revoke = |token: &str| {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/connections/{}", connection.id))
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    };

    let response = app.router.clone().oneshot(revoke("alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Another user's token does not reach alice's record either
    let response = app.router.clone().oneshot(revoke(BOB_TOKEN)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let stored = app.manager.get_user_connections("alice").unwrap();
    assert_eq!(stored[0].status.as_str(), "ACTIVE");
}

#[tokio::test]
async fn test_install_rate_limited_per_user() {
    let app = create_test_app(AppOptions {
        rate_limit_per_minute: Some(2),
        ..Default::default()
    });

    for _ in 0..2 {
        let response = app
            .router
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/connections/install",
                json!({ "providerId": "alpaca" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .router
        .oneshot(json_request(
            "POST",
            "/api/connections/install",
            json!({ "providerId": "alpaca" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // 2 per minute: the next slot opens 30s later
    assert_eq!(response.headers()["retry-after"], "30");
    assert_eq!(body_json(response).await["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn test_install_limit_leaves_api_key_quota() {
    let app = create_test_app(AppOptions {
        rate_limit_per_minute: Some(1),
        ..Default::default()
    });

    let install = || json_request("POST", "/api/connections/install", json!({ "providerId": "alpaca" }));
    assert_eq!(
        app.router.clone().oneshot(install()).await.unwrap().status(),
        StatusCode::OK
    );
    assert_eq!(
        app.router.clone().oneshot(install()).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    let response = app
        .router
        .oneshot(json_request(
            "POST",
            "/api/connections/api-key",
            json!({ "providerId": "polygon", "apiKey": "good-key" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
