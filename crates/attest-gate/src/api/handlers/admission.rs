//! Admission Handlers
//!
//! The webhook always answers 200 with an AdmissionReview; the decision is
//! in the body. The direct check reports a denial as 403.

use axum::{body::Bytes, extract::State, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::admission::{self, AdmissionReview};
use crate::api::error::ApiError;
use crate::api::handlers::occurrences::AppState;

#[derive(Debug, Deserialize)]
pub struct EnforceRequest {
    pub namespace: String,
    pub resource_uri: String,
}

#[derive(Debug, Serialize)]
pub struct EnforceResponse {
    pub allowed: bool,
    pub namespace: String,
    pub resource_uri: String,
}

/// Check one resource against a namespace's requirements
///
/// POST /v1/enforce
pub async fn enforce(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnforceRequest>,
) -> Result<Json<EnforceResponse>, ApiError> {
    if request.namespace.is_empty() || request.resource_uri.is_empty() {
        return Err(ApiError::BadRequest(
            "Namespace and resource URI are required".into(),
        ));
    }

    state
        .enforcer
        .enforce(&request.namespace, &request.resource_uri)
        .await?;

    Ok(Json(EnforceResponse {
        allowed: true,
        namespace: request.namespace,
        resource_uri: request.resource_uri,
    }))
}

/// Kubernetes validating admission webhook
///
/// POST /validate
pub async fn validate(State(state): State<Arc<AppState>>, body: Bytes) -> Json<AdmissionReview> {
    Json(admission::review(&state.enforcer, &body).await)
}
