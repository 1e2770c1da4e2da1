mod common;

use anyhow::Result;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use common::{body_json, external_id, TestApp};
use guildhost::auth::identity::ExternalGuild;
use serde_json::json;

#[tokio::test]
async fn login_sets_state_cookie_and_returns_auth_url() -> Result<()> {
    let app = TestApp::new();

    let response = app.get("/auth/login", None).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = body_json(response.into_body()).await?;

    let state = body["state"].as_str().unwrap();
    assert!(body["auth_url"].as_str().unwrap().contains(state));
    assert!(cookie.starts_with(&format!("oauth_state={state}")));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Max-Age=600"));
    Ok(())
}

#[tokio::test]
async fn callback_then_me_roundtrip() -> Result<()> {
    let app = TestApp::new();
    let session = app.login("alice").await?;

    let response = app.get("/auth/me", Some(&session.access_token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["user"]["user_id"], json!(session.user_id));
    assert_eq!(body["user"]["external_user_id"], json!(external_id("alice")));
    assert_eq!(body["user"]["display_name"], json!("alice"));
    Ok(())
}

#[tokio::test]
async fn callback_rejects_mismatched_state() -> Result<()> {
    let app = TestApp::new();

    let request = Request::builder()
        .method(Method::GET)
        .uri("/auth/callback?code=alice&state=forged")
        .header(header::COOKIE, "oauth_state=expected")
        .body(Body::empty())?;
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let cleared = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cleared.contains("Max-Age=0"));
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    assert!(app.sessions.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn callback_requires_code_and_state() -> Result<()> {
    let app = TestApp::new();
    let response = app.get("/auth/callback?state=abc", None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = app.get("/auth/callback?code=alice", None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn failed_code_exchange_is_a_provider_error() -> Result<()> {
    let app = TestApp::new();
    let request = Request::builder()
        .uri("/auth/callback?code=bad-code&state=s1")
        .header(header::COOKIE, "oauth_state=s1")
        .body(Body::empty())?;
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["code"], "DISCORD_API_ERROR");
    assert!(app.sessions.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn refresh_keeps_the_refresh_token() -> Result<()> {
    let app = TestApp::new();
    let session = app.login("alice").await?;

    for _ in 0..2 {
        let response = app
            .post_json(
                "/auth/refresh",
                &json!({ "refresh_token": session.refresh_token }),
                None,
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await?;
        assert_eq!(body["refresh_token"], json!(session.refresh_token));
        assert_ne!(body["access_token"], json!(session.refresh_token));
        assert_eq!(body["expires_in"], json!(3600));
    }
    Ok(())
}

#[tokio::test]
async fn refresh_rejects_access_tokens_and_bad_bodies() -> Result<()> {
    let app = TestApp::new();
    let session = app.login("alice").await?;

    let response = app
        .post_json(
            "/auth/refresh",
            &json!({ "refresh_token": session.access_token }),
            None,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["message"], "Failed to refresh token");

    let response = app
        .post_json("/auth/refresh", &json!({ "token": "x" }), None)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn logout_invalidates_the_session() -> Result<()> {
    let app = TestApp::new();
    let session = app.login("alice").await?;

    let response = app
        .post_json("/auth/logout", &json!({}), Some(&session.access_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["message"], "Successfully logged out");

    let response = app.get("/auth/me", Some(&session.access_token)).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .post_json("/auth/logout", &json!({}), Some(&session.access_token))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn logout_without_bearer_is_a_validation_error() -> Result<()> {
    let app = TestApp::new();
    let response = app.post_json("/auth/logout", &json!({}), None).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["code"], "VALIDATION_ERROR");
    Ok(())
}

#[tokio::test]
async fn protected_routes_reject_bad_bearers() -> Result<()> {
    let app = TestApp::new();

    let response = app.get("/api/guilds", None).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["message"], "Authorization header required");

    for value in ["Bearer", "Bearer ", "Token abc"] {
        let request = Request::builder()
            .uri("/api/guilds")
            .header(header::AUTHORIZATION, value)
            .body(Body::empty())?;
        let response = app.send(request).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{value:?}");
    }

    let response = app.get("/api/guilds", Some("not-a-jwt")).await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["message"], "Invalid or expired token");
    Ok(())
}

#[tokio::test]
async fn guilds_are_annotated_with_install_rights() -> Result<()> {
    let guild = |id: &str, owner: bool, permissions: &str| ExternalGuild {
        id: id.to_string(),
        name: format!("Guild {id}"),
        icon: None,
        owner,
        permissions: permissions.to_string(),
    };
    let app = TestApp::build(
        common::test_config(),
        common::FakeIdentityProvider::with_guilds(vec![
            guild("owned", true, "0"),
            guild("managed", false, "32"),
            guild("member", false, "1024"),
        ]),
    );
    let session = app.login("alice").await?;

    let response = app.get("/api/guilds", Some(&session.access_token)).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    let installable: Vec<bool> = body["guilds"]
        .as_array()
        .unwrap()
        .iter()
        .map(|guild| guild["can_install"].as_bool().unwrap())
        .collect();
    assert_eq!(installable, vec![true, true, false]);
    assert_eq!(body["guilds"][0]["id"], "owned");
    Ok(())
}

#[tokio::test]
async fn health_probes_answer() -> Result<()> {
    let app = TestApp::new();
    for (path, status) in [
        ("/health", "healthy"),
        ("/healthz", "healthy"),
        ("/live", "alive"),
        ("/ready", "ready"),
    ] {
        let response = app.get(path, None).await?;
        assert_eq!(response.status(), StatusCode::OK, "{path}");
        let body = body_json(response.into_body()).await?;
        assert_eq!(body["status"], status, "{path}");
    }
    Ok(())
}
