// HTTP API

pub mod oauth;

pub use oauth::{create_oauth_router, AppError, OAuthAppState};

use axum::{response::Json, routing::get, Router};
use serde_json::{json, Value};

/// Full application router: OAuth endpoints plus health check.
pub fn create_router(state: OAuthAppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(create_oauth_router(state))
}

/// GET /health
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
