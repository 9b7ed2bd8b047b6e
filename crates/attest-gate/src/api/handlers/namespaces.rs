//! Namespace Label Handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::handlers::occurrences::AppState;
use crate::enforcer::namespace::Labels;

#[derive(Debug, Deserialize)]
pub struct SetLabelsRequest {
    pub labels: Labels,
}

#[derive(Debug, Serialize)]
pub struct NamespaceLabelsResponse {
    pub namespace: String,
    pub labels: Labels,
    /// Attesters the enforcer currently requires for the namespace
    pub required_attesters: Vec<String>,
}

/// Replace a namespace's labels
///
/// PUT /v1/namespaces/{name}/labels
pub async fn set_namespace_labels(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
    Json(request): Json<SetLabelsRequest>,
) -> Result<Json<NamespaceLabelsResponse>, ApiError> {
    if namespace.is_empty() {
        return Err(ApiError::BadRequest("Namespace cannot be empty".into()));
    }

    state.namespaces.set_labels(namespace.clone(), request.labels.clone());
    let required = state.enforcer.required_attesters(&namespace).await?;

    Ok(Json(NamespaceLabelsResponse {
        namespace,
        labels: request.labels,
        required_attesters: required.into_iter().collect(),
    }))
}
