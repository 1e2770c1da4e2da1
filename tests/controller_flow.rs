mod common;

use std::sync::Arc;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Utc;
use common::{body_json, test_config, FakeIdentityProvider, TestApp, SUPER_ADMIN_LOGIN};
use guildhost::agent::{AgentError, BackendClient, ControlPlaneClient};
use guildhost::config::AgentConfig;
use guildhost::controllers::protocol::{sign_handshake, HeartbeatRequest};
use guildhost::models::ControllerStatus;
use guildhost::store::Store;
use serde_json::{json, Value};
use uuid::Uuid;

fn handshake_body(cluster_id: &str) -> Value {
    json!({
        "cluster_id": cluster_id,
        "cluster_name": "C",
        "version": "1.0.0",
        "nonce": "n1",
    })
}

async fn handshake(app: &TestApp, cluster_id: &str) -> Result<Value> {
    let response = app
        .post_json("/api/controller/handshake", &handshake_body(cluster_id), None)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response.into_body()).await
}

async fn heartbeat(app: &TestApp, token: &str, body: Value) -> Result<(StatusCode, Value)> {
    let response = app
        .post_json("/api/controller/heartbeat", &body, Some(token))
        .await?;
    let status = response.status();
    Ok((status, body_json(response.into_body()).await?))
}

#[tokio::test]
async fn handshake_registers_new_cluster_pending_approval() -> Result<()> {
    let app = TestApp::new();
    let body = handshake(&app, "c1").await?;

    assert_eq!(body["success"], true);
    assert_eq!(body["heartbeat_ttl"], 300);
    assert_eq!(body["heartbeat_url"], "/api/controller/heartbeat");
    let controller_id: Uuid = body["controller_id"].as_str().unwrap().parse()?;
    let claims = app
        .state
        .registry
        .verify_token(body["token"].as_str().unwrap())?;
    assert_eq!(claims.sub, controller_id.to_string());

    let stored = app.store.find_controller_by_cluster("c1").await?.unwrap();
    assert_eq!(stored.id, controller_id);
    assert_eq!(stored.status, ControllerStatus::PendingApproval);
    Ok(())
}

#[tokio::test]
async fn handshake_rejects_malformed_requests() -> Result<()> {
    let app = TestApp::new();

    let mut body = handshake_body("c1");
    body["nonce"] = json!("");
    let response = app
        .post_json("/api/controller/handshake", &body, None)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["success"], false);

    let response = app
        .post_json("/api/controller/handshake", &json!({ "cluster_id": "c1" }), None)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await?;
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid request format"));
    Ok(())
}

#[tokio::test]
async fn handshake_checks_signature_when_secret_configured() -> Result<()> {
    let mut config = test_config();
    config.controller_handshake_secret = Some("shared".to_string());
    let app = TestApp::build(config, FakeIdentityProvider::default());

    let mut body = handshake_body("c1");
    body["signature"] = json!(sign_handshake(b"other", "c1", "n1")?);
    let response = app
        .post_json("/api/controller/handshake", &body, None)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let rejected = body_json(response.into_body()).await?;
    assert_eq!(
        rejected,
        json!({ "success": false, "message": "Invalid handshake secret" })
    );
    assert!(app.store.find_controller_by_cluster("c1").await?.is_none());

    body["signature"] = json!(sign_handshake(b"shared", "c1", "n1")?);
    let response = app
        .post_json("/api/controller/handshake", &body, None)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn unsigned_handshake_is_refused_when_signatures_are_required() -> Result<()> {
    let mut config = test_config();
    config.controller_handshake_secret = Some("shared".to_string());
    config.require_signed_handshake = true;
    let app = TestApp::build(config, FakeIdentityProvider::default());

    let response = app
        .post_json("/api/controller/handshake", &handshake_body("c1"), None)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.store.find_controller_by_cluster("c1").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn rehandshake_preserves_approval() -> Result<()> {
    let app = TestApp::new();
    let admin = app.login(SUPER_ADMIN_LOGIN).await?;
    let first = handshake(&app, "c1").await?;
    let controller_id = first["controller_id"].as_str().unwrap().to_string();

    let response = app
        .post_json(
            &format!("/api/controllers/{controller_id}/approve"),
            &json!({}),
            Some(&admin.access_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let second = handshake(&app, "c1").await?;
    assert_eq!(second["controller_id"], json!(controller_id));
    assert_eq!(second["message"], "Controller re-registered successfully");

    let stored = app.store.find_controller_by_cluster("c1").await?.unwrap();
    assert_eq!(stored.status, ControllerStatus::Active);
    assert!(stored.approved_by.is_some());
    Ok(())
}

#[tokio::test]
async fn heartbeat_from_pending_controller_keeps_status() -> Result<()> {
    let app = TestApp::new();
    let registered = handshake(&app, "c1").await?;
    let token = registered["token"].as_str().unwrap();
    let before = app.store.find_controller_by_cluster("c1").await?.unwrap();

    let (status, body) = heartbeat(&app, token, json!({ "status": "active" })).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "success": true, "message": "Heartbeat received - controller awaiting approval" })
    );

    let after = app.store.find_controller_by_cluster("c1").await?.unwrap();
    assert_eq!(after.status, ControllerStatus::PendingApproval);
    assert!(after.last_heartbeat >= before.last_heartbeat);
    Ok(())
}

#[tokio::test]
async fn heartbeat_applies_reported_status_once_approved() -> Result<()> {
    let app = TestApp::new();
    let admin = app.login(SUPER_ADMIN_LOGIN).await?;
    let registered = handshake(&app, "c1").await?;
    let token = registered["token"].as_str().unwrap();
    let id = registered["controller_id"].as_str().unwrap();
    app.post_json(
        &format!("/api/controllers/{id}/approve"),
        &json!({}),
        Some(&admin.access_token),
    )
    .await?;

    let (status, body) = heartbeat(
        &app,
        token,
        json!({ "status": "degraded", "metrics": { "uptime_seconds": "12" } }),
    )
    .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Heartbeat received");
    let stored = app.store.find_controller_by_cluster("c1").await?.unwrap();
    assert_eq!(stored.status, ControllerStatus::Degraded);
    Ok(())
}

#[tokio::test]
async fn heartbeat_authentication_failures() -> Result<()> {
    let app = TestApp::new();
    let user = app.login("alice").await?;

    let response = app
        .post_json("/api/controller/heartbeat", &json!({ "status": "active" }), None)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response.into_body()).await?;
    assert_eq!(
        body,
        json!({ "success": false, "message": "Missing authorization header" })
    );

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/controller/heartbeat")
        .header(header::AUTHORIZATION, "Token abc")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"status":"active"}"#))?;
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["message"], "Invalid authorization header format");

    let (status, body) =
        heartbeat(&app, &user.access_token, json!({ "status": "active" })).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid or expired token");
    Ok(())
}

#[tokio::test]
async fn heartbeat_for_deleted_controller_is_not_found() -> Result<()> {
    let app = TestApp::new();
    let registered = handshake(&app, "c1").await?;
    let token = registered["token"].as_str().unwrap();

    app.store
        .delete_controllers_before(Utc::now() + chrono::Duration::minutes(1))
        .await?;

    let (status, body) = heartbeat(&app, token, json!({ "status": "active" })).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "success": false, "message": "Controller not found" }));
    Ok(())
}

#[tokio::test]
async fn management_routes_require_super_admin() -> Result<()> {
    let app = TestApp::new();
    let user = app.login("alice").await?;
    let admin = app.login(SUPER_ADMIN_LOGIN).await?;
    let registered = handshake(&app, "c1").await?;
    let id = registered["controller_id"].as_str().unwrap();

    let response = app.get("/api/controllers", Some(&user.access_token)).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app.get("/api/controllers", Some(&admin.access_token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["controllers"].as_array().unwrap().len(), 1);
    assert_eq!(body["controllers"][0]["is_online"], true);

    let response = app
        .get(&format!("/api/controllers/{id}"), Some(&admin.access_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["controller"]["status"], "pending_approval");

    let response = app
        .get("/api/controllers/not-a-uuid", Some(&admin.access_token))
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn approval_only_from_pending_and_reject_from_anywhere() -> Result<()> {
    let app = TestApp::new();
    let admin = app.login(SUPER_ADMIN_LOGIN).await?;
    let registered = handshake(&app, "c1").await?;
    let id = registered["controller_id"].as_str().unwrap();
    let approve = format!("/api/controllers/{id}/approve");

    let response = app
        .post_json(&approve, &json!({}), Some(&admin.access_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let response = app
        .post_json(&approve, &json!({}), Some(&admin.access_token))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .post_json(
            &format!("/api/controllers/{id}/reject"),
            &json!({ "reason": "unknown cluster" }),
            Some(&admin.access_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["message"], "Controller rejected: unknown cluster");

    let stored = app.store.find_controller_by_cluster("c1").await?.unwrap();
    assert_eq!(stored.status, ControllerStatus::Rejected);
    Ok(())
}

#[tokio::test]
async fn cleanup_endpoint_sweeps_silent_controllers() -> Result<()> {
    let app = TestApp::new();
    let admin = app.login(SUPER_ADMIN_LOGIN).await?;
    handshake(&app, "c1").await?;

    let response = app
        .post_json(
            "/api/admin/cleanup-controllers",
            &json!({}),
            Some(&admin.access_token),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["deleted"], 0);
    assert!(app.store.find_controller_by_cluster("c1").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn agent_client_talks_to_the_router() -> Result<()> {
    let app = TestApp::new();
    let base_url = app.spawn_server().await?;
    let client = Arc::new(BackendClient::new(&AgentConfig {
        backend_url: base_url,
        cluster_id: "edge-1".into(),
        cluster_name: "Edge".into(),
        version: "0.1.0".into(),
        health_port: 0,
        handshake_secret: None,
    })?);

    let registration = client.handshake().await?;
    assert_eq!(registration.heartbeat_interval.as_secs(), 300);
    assert_eq!(client.registration().await, Some(registration.clone()));

    let response = client
        .send_heartbeat(HeartbeatRequest {
            status: ControllerStatus::Active,
            message: Some("Controller is running".into()),
            metrics: [("uptime_seconds".to_string(), "0".to_string())].into(),
            resources: Default::default(),
        })
        .await?;
    assert!(response.success);
    assert_eq!(
        response.message,
        "Heartbeat received - controller awaiting approval"
    );

    app.store
        .delete_controllers_before(Utc::now() + chrono::Duration::minutes(1))
        .await?;
    let err = client
        .send_heartbeat(HeartbeatRequest {
            status: ControllerStatus::Active,
            message: None,
            metrics: Default::default(),
            resources: Default::default(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Status { status: 404, .. }));
    Ok(())
}
