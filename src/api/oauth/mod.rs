//! OAuth 1.0a connection endpoints for agents.
//!
//! 1. Dashboard calls POST /api/agents/:agent_id/oauth/initiate (bearer token)
//! 2. User is sent to the returned authorization URL
//! 3. Platform redirects to GET /api/oauth/callback
//! 4. Callback redirects the browser back to the application with the outcome

use crate::auth::CallerAuthenticator;
use crate::credentials::{ConnectionState, CredentialError};
use crate::flow::{CallbackOutcome, CallbackParams, FlowError, OAuthFlowOrchestrator};
use crate::oauth1::UpstreamErrorKind;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};


/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

/// Application error types for OAuth endpoints
pub enum AppError {
    Unauthorized(String),
    Flow(FlowError),
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        AppError::Flow(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let flow = match self {
            AppError::Unauthorized(msg) => {
                let body = Json(ErrorResponse {
                    error: "unauthorized".to_string(),
                    message: msg,
                });
                return (StatusCode::UNAUTHORIZED, body).into_response();
            }
            AppError::Flow(flow) => flow,
        };

        let status = match &flow {
            FlowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FlowError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            FlowError::ExpiredSession => StatusCode::GONE,
            FlowError::Upstream(e) => match e.kind {
                UpstreamErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                UpstreamErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
                UpstreamErrorKind::ClientError | UpstreamErrorKind::ServerError => {
                    StatusCode::BAD_GATEWAY
                }
            },
            FlowError::Credential(CredentialError::Encryption(_))
            | FlowError::Credential(CredentialError::Decryption { .. })
            | FlowError::Credential(CredentialError::Persistence(_)) => {
                error!(error = %flow, "Credential storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            error: flow.code().to_string(),
            message: flow.user_message(),
        });
        let mut response = (status, body).into_response();

        if let FlowError::RateLimited {
            retry_after_seconds,
        } = flow
        {
            if let Ok(value) = HeaderValue::from_str(&retry_after_seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Shared application state for OAuth API
#[derive(Clone)]
pub struct OAuthAppState {
    pub flow: Arc<OAuthFlowOrchestrator>,
    pub authenticator: Arc<dyn CallerAuthenticator>,
    /// Where the browser lands after the callback
    pub app_redirect_url: String,
}

/// Callback query parameters, as sent by the platform
#[derive(Deserialize, Default, Debug)]
pub struct OAuthCallback {
    oauth_token: Option<String>,
    oauth_verifier: Option<String>,
    denied: Option<String>,
    #[serde(rename = "agentId")]
    agent_id: Option<String>,
}

/// Response for POST /api/agents/:agent_id/oauth/initiate
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub authorization_url: String,
}

/// Response for GET /api/agents/:agent_id/oauth
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub agent_id: String,
    #[serde(flatten)]
    pub state: ConnectionState,
}

/// Create OAuth API router
pub fn create_oauth_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/api/agents/:agent_id/oauth/initiate", post(initiate))
        .route(
            "/api/agents/:agent_id/oauth",
            get(connection_status).delete(disconnect),
        )
        .route("/api/oauth/callback", get(oauth_callback))
        .with_state(Arc::new(state))
}

fn authenticate(state: &OAuthAppState, headers: &HeaderMap) -> Result<String, AppError> {
    state.authenticator.authenticate(headers).map_err(|e| {
        warn!(error = %e, "Rejected unauthenticated request");
        AppError::Unauthorized(e.to_string())
    })
}

/// POST /api/agents/:agent_id/oauth/initiate
///
/// Starts a handshake and returns the platform authorization URL.
///
/// # Security
/// - Requires bearer token; the resolved caller identity is rate limited
async fn initiate(
    State(state): State<Arc<OAuthAppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<InitiateResponse>, AppError> {
    let caller = authenticate(&state, &headers)?;
    debug!(agent_id = %agent_id, caller = %caller, "OAuth initiate requested");

    let authorization_url = state.flow.initiate(&agent_id, &caller).await?;

    Ok(Json(InitiateResponse { authorization_url }))
}

/// GET /api/oauth/callback
///
/// Platform redirect target. Always answers with a redirect back to the
/// application; failures travel in the `oauth_error` query parameter.
async fn oauth_callback(
    State(state): State<Arc<OAuthAppState>>,
    query: Option<Query<OAuthCallback>>,
) -> Redirect {
    let callback = query.map(|Query(q)| q).unwrap_or_default();
    debug!(agent_id = ?callback.agent_id, "OAuth callback received");

    let params = CallbackParams {
        oauth_token: callback.oauth_token,
        oauth_verifier: callback.oauth_verifier,
        denied: callback.denied,
        agent_id: callback.agent_id,
    };

    let outcome = match state.flow.callback(params).await {
        Ok(CallbackOutcome::Connected {
            external_handle, ..
        }) => {
            info!(external_handle = %external_handle, "OAuth callback completed");
            Ok(())
        }
        Ok(CallbackOutcome::Denied) => Err("Authorization was denied.".to_string()),
        Err(e) => {
            warn!(code = e.code(), error = %e, "OAuth callback failed");
            Err(e.user_message())
        }
    };

    Redirect::to(&redirect_target(&state.app_redirect_url, outcome))
}

/// GET /api/agents/:agent_id/oauth
async fn connection_status(
    State(state): State<Arc<OAuthAppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, AppError> {
    authenticate(&state, &headers)?;

    let connection = state.flow.status(&agent_id)?;

    Ok(Json(StatusResponse {
        agent_id,
        state: connection,
    }))
}

/// DELETE /api/agents/:agent_id/oauth
async fn disconnect(
    State(state): State<Arc<OAuthAppState>>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let caller = authenticate(&state, &headers)?;

    state.flow.disconnect(&agent_id)?;
    info!(agent_id = %agent_id, caller = %caller, "Agent OAuth connection removed");

    Ok(StatusCode::NO_CONTENT)
}

/// Appends the outcome to the application URL.
fn redirect_target(base: &str, outcome: Result<(), String>) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    match outcome {
        Ok(()) => format!("{}{}oauth_success=true", base, separator),
        Err(message) => format!(
            "{}{}oauth_error={}",
            base,
            separator,
            urlencoding::encode(&message)
        ),
    }
}
