//! API module for the attestation gate

pub mod error;
pub mod handlers;

use axum::{
    extract::State,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use handlers::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Readiness check response
#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub attester_count: usize,
    pub enforcer_count: usize,
    pub active_consumers: Vec<String>,
}

/// Health check endpoint
///
/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// Readiness check endpoint
///
/// GET /ready
pub async fn ready(State(state): State<Arc<AppState>>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        ready: true,
        attester_count: state.registry.len(),
        enforcer_count: state.enforcers.len(),
        active_consumers: state.events.active_consumers(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health endpoints
        .route("/health", get(health))
        .route("/ready", get(ready))
        // Facts
        .route(
            "/v1/occurrences",
            post(handlers::create_occurrences).get(handlers::list_occurrences),
        )
        // Attesters
        .route(
            "/v1/attesters",
            post(handlers::register_attester).get(handlers::list_attesters),
        )
        .route(
            "/v1/attesters/{name}",
            get(handlers::get_attester).delete(handlers::delete_attester),
        )
        // Enforcement configuration
        .route(
            "/v1/enforcers",
            post(handlers::apply_enforcer).get(handlers::list_enforcers),
        )
        .route("/v1/enforcers/{name}", delete(handlers::delete_enforcer))
        .route("/v1/namespaces/{name}/labels", put(handlers::set_namespace_labels))
        // Admission
        .route("/v1/enforce", post(handlers::enforce))
        .route("/validate", post(handlers::validate))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
