//! Enforcer Resource Handlers
//!
//! Namespaced enforcers carry a `namespace`; cluster enforcers omit it and
//! pick namespaces with their match strategy.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::api::handlers::occurrences::AppState;
use crate::enforcer::resource::{Condition, EnforcerResource, EnforcerSpec, Scope};

/// Enforcer resource with its observed conditions
#[derive(Debug, Serialize)]
pub struct EnforcerInfo {
    #[serde(flatten)]
    pub spec: EnforcerSpec,
    pub cluster_scoped: bool,
    pub conditions: Vec<Condition>,
}

impl From<&dyn EnforcerResource> for EnforcerInfo {
    fn from(resource: &dyn EnforcerResource) -> Self {
        Self {
            spec: resource.spec().clone(),
            cluster_scoped: resource.scope() == Scope::Cluster,
            conditions: resource.conditions(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ListEnforcersResponse {
    pub enforcers: Vec<EnforcerInfo>,
    pub count: usize,
}

#[derive(Debug, Deserialize)]
pub struct EnforcerQuery {
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Add or replace an enforcer resource
///
/// POST /v1/enforcers
pub async fn apply_enforcer(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<EnforcerSpec>,
) -> Result<Json<EnforcerInfo>, ApiError> {
    if spec.name.is_empty() {
        return Err(ApiError::BadRequest("Enforcer name cannot be empty".into()));
    }
    if spec.attesters.iter().any(|a| a.trim().is_empty()) {
        return Err(ApiError::BadRequest("Attester names cannot be empty".into()));
    }
    if spec.namespace.is_some() && !spec.namespaces.is_empty() {
        return Err(ApiError::BadRequest(
            "Namespaced enforcers cannot list namespaces".into(),
        ));
    }

    let resource = state.enforcers.apply(spec);
    state.enforcer.refresh_conditions(resource.as_ref());

    Ok(Json(EnforcerInfo::from(resource.as_ref())))
}

/// List enforcer resources
///
/// GET /v1/enforcers
pub async fn list_enforcers(State(state): State<Arc<AppState>>) -> Json<ListEnforcersResponse> {
    let enforcers: Vec<EnforcerInfo> = state
        .enforcers
        .list()
        .iter()
        .map(|r| {
            state.enforcer.refresh_conditions(r.as_ref());
            EnforcerInfo::from(r.as_ref())
        })
        .collect();
    let count = enforcers.len();

    Json(ListEnforcersResponse { enforcers, count })
}

/// Remove an enforcer resource
///
/// DELETE /v1/enforcers/{name}?namespace=<ns>
pub async fn delete_enforcer(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<EnforcerQuery>,
) -> Result<Json<EnforcerInfo>, ApiError> {
    let removed = state
        .enforcers
        .remove(query.namespace.as_deref(), &name)
        .ok_or_else(|| ApiError::NotFound(format!("Enforcer '{}' not found", name)))?;

    Ok(Json(EnforcerInfo::from(removed.as_ref())))
}
