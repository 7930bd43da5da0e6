//! HTTP API

mod sessions;

use axum::{
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions/:id", get(sessions::status))
        .route("/v1/sessions/:id", delete(sessions::remove))
        .route("/v1/sessions/:id/speak", post(sessions::speak))
        .route("/v1/sessions/:id/audio", get(sessions::audio))
        .route("/v1/sessions/:id/speech", delete(sessions::clear))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
