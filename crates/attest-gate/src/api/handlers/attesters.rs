//! Attester Handlers
//!
//! Attesters are registered with a Rego policy and either supplied key
//! material or a freshly generated key. Only public key material is ever
//! returned.

use axum::{
    extract::{Path, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use attest_core::{signer::SerializedPublicKey, Attester, RegoPolicy, Signer};

use crate::api::error::ApiError;
use crate::api::handlers::occurrences::AppState;
use crate::config::is_subject_token;

/// Request to register an attester
#[derive(Debug, Deserialize)]
pub struct RegisterAttesterRequest {
    pub name: String,

    /// Rego module defining a `violation` rule
    pub policy: String,

    /// Emit the engine's evaluation trace at debug level
    #[serde(default)]
    pub trace: bool,

    /// Base64-encoded key document from an earlier export; a key is
    /// generated when absent
    #[serde(default)]
    pub signer_key: Option<String>,
}

/// Public view of a registered attester
#[derive(Debug, Serialize)]
pub struct AttesterInfo {
    pub name: String,
    pub policy: String,
    pub note_name: String,
    pub public_key: SerializedPublicKey,
}

impl From<&Attester> for AttesterInfo {
    fn from(attester: &Attester) -> Self {
        Self {
            name: attester.name().to_string(),
            policy: attester.policy_name().to_string(),
            note_name: attester.note_name(),
            public_key: attester.signer().public_key(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RegisterAttesterResponse {
    pub attester: AttesterInfo,
    /// Whether an attester with the same name was replaced
    pub replaced: bool,
}

#[derive(Debug, Serialize)]
pub struct ListAttestersResponse {
    pub attesters: Vec<AttesterInfo>,
    pub count: usize,
}

/// Register or replace an attester
///
/// POST /v1/attesters
///
/// When stream ingestion is enabled the first registration of a name also
/// subscribes to that attester's attestations.
pub async fn register_attester(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterAttesterRequest>,
) -> Result<Json<RegisterAttesterResponse>, ApiError> {
    if !is_subject_token(&request.name) {
        return Err(ApiError::BadRequest(format!(
            "Attester name '{}' must be non-empty and use only letters, digits, '-' and '_'",
            request.name
        )));
    }

    let policy = RegoPolicy::new(request.name.clone(), request.policy, request.trace)?;

    let signer = match request.signer_key {
        Some(encoded) => {
            let document = STANDARD.decode(encoded.trim())?;
            Signer::from_serialized(&document)?
        }
        None => Signer::generate(request.name.clone()),
    };

    let attester = Arc::new(Attester::new(
        request.name.clone(),
        Box::new(policy),
        Arc::new(signer),
    ));
    let info = AttesterInfo::from(attester.as_ref());

    let replaced = state.registry.add(attester).is_some();

    if state.config.ingest_stream && !replaced {
        if let Err(e) = state.events.subscribe(&request.name).await {
            warn!(attester = %request.name, error = %e, "Subscription failed, rolling back registration");
            state.registry.remove(&request.name);
            return Err(e.into());
        }
    }

    info!(
        attester = %info.name,
        key_id = %info.public_key.key_id,
        replaced = replaced,
        "Attester registered"
    );

    Ok(Json(RegisterAttesterResponse {
        attester: info,
        replaced,
    }))
}

/// List registered attesters
///
/// GET /v1/attesters
pub async fn list_attesters(State(state): State<Arc<AppState>>) -> Json<ListAttestersResponse> {
    let attesters: Vec<AttesterInfo> = state
        .registry
        .get_all()
        .values()
        .map(|a| AttesterInfo::from(a.as_ref()))
        .collect();
    let count = attesters.len();

    Json(ListAttestersResponse { attesters, count })
}

/// Get one attester
///
/// GET /v1/attesters/{name}
pub async fn get_attester(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AttesterInfo>, ApiError> {
    let attester = state
        .registry
        .get(&name)
        .ok_or_else(|| ApiError::NotFound(format!("Attester '{}' not found", name)))?;

    Ok(Json(AttesterInfo::from(attester.as_ref())))
}

/// Remove an attester
///
/// DELETE /v1/attesters/{name}
pub async fn delete_attester(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AttesterInfo>, ApiError> {
    let removed = state
        .registry
        .remove(&name)
        .ok_or_else(|| ApiError::NotFound(format!("Attester '{}' not found", name)))?;

    if state.config.ingest_stream {
        state.events.unsubscribe(&name).await?;
    }

    Ok(Json(AttesterInfo::from(removed.as_ref())))
}
