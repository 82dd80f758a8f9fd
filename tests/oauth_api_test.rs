// Integration tests for the OAuth HTTP endpoints.
//
// The full router runs against in-memory SQLite and a scripted platform double.

use agentlink::api::{create_router, OAuthAppState};
use agentlink::auth::StaticTokenAuthenticator;
use agentlink::clock::ManualClock;
use agentlink::config::Environment;
use agentlink::credentials::{
    AgentId, CredentialStore, PermanentCredentials, SecretCipher, SqliteGateway,
};
use agentlink::flow::OAuthFlowOrchestrator;
use agentlink::oauth1::{PlatformClient, RequestToken, UpstreamError, UpstreamErrorKind};
use agentlink::rate_limit::FixedWindowLimiter;
use agentlink::token_cache::TemporaryTokenCache;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use chrono::Duration;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

const APP_URL: &str = "https://app.example.com/agents";

// ── Test platform ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedPlatform {
    issued: AtomicUsize,
    failure: Mutex<Option<UpstreamErrorKind>>,
}

#[async_trait]
impl PlatformClient for ScriptedPlatform {
    async fn request_token(&self, _callback_url: &str) -> Result<RequestToken, UpstreamError> {
        if let Some(kind) = *self.failure.lock().unwrap() {
            return Err(UpstreamError::new(kind, "<html>upstream stack trace</html>"));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RequestToken {
            token: format!("req-token-{}", n),
            secret: format!("req-secret-{}", n),
        })
    }

    async fn access_token(
        &self,
        _request_token: &str,
        _request_secret: &str,
        _verifier: &str,
    ) -> Result<PermanentCredentials, UpstreamError> {
        if let Some(kind) = *self.failure.lock().unwrap() {
            return Err(UpstreamError::new(kind, "<html>upstream stack trace</html>"));
        }
        Ok(PermanentCredentials {
            access_token: "access-token".to_string(),
            access_secret: "access-secret".to_string(),
            external_user_id: "783214".to_string(),
            external_handle: "agent_bot".to_string(),
        })
    }

    fn authorization_url(&self, request_token: &str) -> String {
        format!(
            "https://platform.test/oauth/authorize?oauth_token={}",
            request_token
        )
    }
}

fn create_test_app() -> (Router, Arc<ScriptedPlatform>) {
    let clock = ManualClock::default();
    let cache = Arc::new(TemporaryTokenCache::new(
        Duration::minutes(10),
        Arc::new(clock.clone()),
    ));
    let cipher = SecretCipher::new("api-test-secret", Environment::Development).unwrap();
    let store = Arc::new(CredentialStore::new(
        Arc::new(SqliteGateway::open(":memory:").unwrap()),
        cipher,
        cache,
    ));
    let limiter = Arc::new(FixedWindowLimiter::new(
        Duration::minutes(5),
        10,
        Arc::new(clock),
    ));
    let platform = Arc::new(ScriptedPlatform::default());
    let flow = Arc::new(OAuthFlowOrchestrator::new(
        store,
        limiter,
        platform.clone(),
        "https://agentlink.test",
    ));

    let mut tokens = HashMap::new();
    tokens.insert("test-token".to_string(), "dashboard".to_string());

    let state = OAuthAppState {
        flow,
        authenticator: Arc::new(StaticTokenAuthenticator::new(tokens)),
        app_redirect_url: APP_URL.to_string(),
    };
    (create_router(state), platform)
}

fn initiate_request(agent_id: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/api/agents/{}/oauth/initiate", agent_id));
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    builder.body(Body::empty()).unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header("Authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn location(response: &axum::response::Response) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}

async fn initiate_ok(app: &Router, agent: &AgentId) -> String {
    let response = app
        .clone()
        .oneshot(initiate_request(&agent.to_string(), Some("test-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let url = body["authorizationUrl"].as_str().unwrap();
    url.rsplit_once("oauth_token=").unwrap().1.to_string()
}

// ── Initiation ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_initiate_requires_bearer_token() {
    let (app, platform) = create_test_app();
    let agent = AgentId::new_random().to_string();

    let response = app
        .clone()
        .oneshot(initiate_request(&agent, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(initiate_request(&agent, Some("wrong-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = json_body(response).await;
    assert_eq!(body["error"], "unauthorized");

    assert_eq!(platform.issued.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_initiate_rejects_invalid_agent_id() {
    let (app, _) = create_test_app();

    let response = app
        .oneshot(initiate_request("agent-1", Some("test-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "invalid_input");
}

#[tokio::test]
async fn test_initiate_returns_authorization_url() {
    let (app, _) = create_test_app();
    let agent = AgentId::new_random();

    let response = app
        .oneshot(initiate_request(&agent.to_string(), Some("test-token")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(
        body["authorizationUrl"],
        "https://platform.test/oauth/authorize?oauth_token=req-token-1"
    );
}

#[tokio::test]
async fn test_initiate_rate_limited_with_retry_after() {
    let (app, platform) = create_test_app();

    for _ in 0..10 {
        initiate_ok(&app, &AgentId::new_random()).await;
    }

    let response = app
        .oneshot(initiate_request(
            &AgentId::new_random().to_string(),
            Some("test-token"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = response
        .headers()
        .get(header::RETRY_AFTER)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 300);
    let body = json_body(response).await;
    assert_eq!(body["error"], "rate_limited");

    assert_eq!(platform.issued.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn test_initiate_upstream_failures() {
    let cases = [
        (UpstreamErrorKind::Timeout, StatusCode::GATEWAY_TIMEOUT),
        (UpstreamErrorKind::RateLimited, StatusCode::TOO_MANY_REQUESTS),
        (UpstreamErrorKind::ClientError, StatusCode::BAD_GATEWAY),
        (UpstreamErrorKind::ServerError, StatusCode::BAD_GATEWAY),
    ];

    for (kind, status) in cases {
        let (app, platform) = create_test_app();
        *platform.failure.lock().unwrap() = Some(kind);

        let response = app
            .oneshot(initiate_request(
                &AgentId::new_random().to_string(),
                Some("test-token"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), status);
        let body = json_body(response).await;
        assert!(!body["message"].as_str().unwrap().contains("stack trace"));
    }
}

// ── Callback ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_callback_success_redirects() {
    let (app, _) = create_test_app();
    let agent = AgentId::new_random();
    let token = initiate_ok(&app, &agent).await;

    let uri = format!(
        "/api/oauth/callback?oauth_token={}&oauth_verifier=verifier-1&agentId={}",
        token, agent
    );
    let response = app.clone().oneshot(get_request(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        location(&response),
        "https://app.example.com/agents?oauth_success=true"
    );

    let response = app
        .oneshot(get_request(&format!("/api/agents/{}/oauth", agent)))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["state"], "connected");
    assert_eq!(body["externalHandle"], "agent_bot");
}

#[tokio::test]
async fn test_callback_denied_redirects_with_error() {
    let (app, _) = create_test_app();
    let agent = AgentId::new_random();
    let token = initiate_ok(&app, &agent).await;

    let uri = format!("/api/oauth/callback?denied={}&agentId={}", token, agent);
    let response = app.clone().oneshot(get_request(&uri)).await.unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(location(&response).starts_with("https://app.example.com/agents?oauth_error="));

    let response = app
        .oneshot(get_request(&format!("/api/agents/{}/oauth", agent)))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["state"], "disconnected");
}

#[tokio::test]
async fn test_callback_failures_always_redirect() {
    let (app, platform) = create_test_app();
    let agent = AgentId::new_random();
    let token = initiate_ok(&app, &agent).await;

    let uris = [
        // No parameters at all
        "/api/oauth/callback".to_string(),
        // Unknown request token
        format!(
            "/api/oauth/callback?oauth_token=never-issued&oauth_verifier=v&agentId={}",
            agent
        ),
        // Malformed agent id
        format!(
            "/api/oauth/callback?oauth_token={}&oauth_verifier=v&agentId=agent-1",
            token
        ),
    ];

    for uri in &uris {
        let response = app.clone().oneshot(get_request(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER, "uri: {}", uri);
        assert!(location(&response).contains("oauth_error="), "uri: {}", uri);
    }

    // Upstream failure during the exchange also redirects, without leaking details
    *platform.failure.lock().unwrap() = Some(UpstreamErrorKind::ServerError);
    let uri = format!(
        "/api/oauth/callback?oauth_token={}&oauth_verifier=v&agentId={}",
        token, agent
    );
    let response = app.oneshot(get_request(&uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let target = location(&response);
    assert!(target.contains("oauth_error="));
    assert!(!target.contains("stack"));
}

#[tokio::test]
async fn test_replayed_callback_redirects_with_error() {
    let (app, _) = create_test_app();
    let agent = AgentId::new_random();
    let token = initiate_ok(&app, &agent).await;
    let uri = format!(
        "/api/oauth/callback?oauth_token={}&oauth_verifier=v&agentId={}",
        token, agent
    );

    let first = app.clone().oneshot(get_request(&uri)).await.unwrap();
    assert!(location(&first).ends_with("oauth_success=true"));

    let second = app.oneshot(get_request(&uri)).await.unwrap();
    assert_eq!(second.status(), StatusCode::SEE_OTHER);
    assert!(location(&second).contains("oauth_error="));
}

// ── Status / disconnect / health ──────────────────────────────────────────────

#[tokio::test]
async fn test_disconnect_removes_connection() {
    let (app, _) = create_test_app();
    let agent = AgentId::new_random();
    let token = initiate_ok(&app, &agent).await;
    let uri = format!(
        "/api/oauth/callback?oauth_token={}&oauth_verifier=v&agentId={}",
        token, agent
    );
    app.clone().oneshot(get_request(&uri)).await.unwrap();

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/agents/{}/oauth", agent))
        .header("Authorization", "Bearer test-token")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get_request(&format!("/api/agents/{}/oauth", agent)))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["agentId"], agent.to_string());
    assert_eq!(body["state"], "disconnected");
}

#[tokio::test]
async fn test_status_requires_bearer_token() {
    let (app, _) = create_test_app();
    let request = Request::builder()
        .method("GET")
        .uri(format!("/api/agents/{}/oauth", AgentId::new_random()))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health() {
    let (app, _) = create_test_app();
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
}
