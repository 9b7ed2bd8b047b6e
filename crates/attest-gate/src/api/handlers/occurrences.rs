//! Occurrence Handlers
//!
//! New facts enter through the orchestrator, which re-attests every resource
//! they touch. Also defines the shared application state.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use attest_core::{AttestWrapper, AttesterRegistry, Occurrence, OccurrenceStore};
use attest_stream::{DurableLog, EventManager, EventManagerConfig};

use crate::api::error::ApiError;
use crate::config::GateConfig;
use crate::enforcer::namespace::StaticNamespaces;
use crate::enforcer::resource::EnforcerDirectory;
use crate::enforcer::{Enforcer, EnforcerConfig};

/// Application state shared across handlers
#[derive(Debug)]
pub struct AppState {
    pub config: GateConfig,
    /// Fact store
    pub store: Arc<dyn OccurrenceStore>,
    pub registry: Arc<AttesterRegistry>,
    /// Orchestrator publishing through `events`
    pub wrapper: AttestWrapper,
    pub events: Arc<EventManager>,
    pub enforcer: Enforcer,
    pub namespaces: Arc<StaticNamespaces>,
    pub enforcers: Arc<EnforcerDirectory>,
}

impl AppState {
    /// Wire the attestation pipeline, event stream and enforcer around one
    /// fact store
    pub fn new(config: GateConfig, store: Arc<dyn OccurrenceStore>, log: Arc<dyn DurableLog>) -> Self {
        let registry = Arc::new(AttesterRegistry::new());
        let namespaces = Arc::new(StaticNamespaces::new());
        let enforcers = Arc::new(EnforcerDirectory::new());

        let events = Arc::new(EventManager::new(
            log,
            store.clone(),
            EventManagerConfig {
                domain: config.stream_domain.clone(),
                fetch_wait: config.fetch_wait,
                ..Default::default()
            },
        ));

        let wrapper = AttestWrapper::new(store.clone(), registry.clone()).with_publisher(events.clone());

        let enforcer = Enforcer::new(
            EnforcerConfig::from(&config),
            store.clone(),
            registry.clone(),
            namespaces.clone(),
            enforcers.clone(),
        );

        Self {
            config,
            store,
            registry,
            wrapper,
            events,
            enforcer,
            namespaces,
            enforcers,
        }
    }
}

/// Request to record new occurrences
#[derive(Debug, Deserialize)]
pub struct CreateOccurrencesRequest {
    pub occurrences: Vec<Occurrence>,
}

/// Occurrences returned by create and list
#[derive(Debug, Serialize)]
pub struct OccurrencesResponse {
    pub occurrences: Vec<Occurrence>,
    pub count: usize,
}

impl From<Vec<Occurrence>> for OccurrencesResponse {
    fn from(occurrences: Vec<Occurrence>) -> Self {
        let count = occurrences.len();
        Self { occurrences, count }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListOccurrencesQuery {
    pub resource: String,
}

/// Record occurrences and attest the resources they describe
///
/// POST /v1/occurrences
///
/// Returns the stored input occurrences; attestations produced on the way
/// are listed with the resource.
pub async fn create_occurrences(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateOccurrencesRequest>,
) -> Result<Json<OccurrencesResponse>, ApiError> {
    if request.occurrences.is_empty() {
        return Err(ApiError::BadRequest("No occurrences given".into()));
    }
    if request.occurrences.iter().any(Occurrence::is_attestation) {
        return Err(ApiError::BadRequest(
            "Attestations are produced by attesters, not submitted".into(),
        ));
    }

    let count = request.occurrences.len();
    let created = state.wrapper.create_occurrences(request.occurrences).await?;

    info!(count = count, "Recorded occurrences");

    Ok(Json(created.into()))
}

/// List every occurrence of a resource
///
/// GET /v1/occurrences?resource=<uri>
pub async fn list_occurrences(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListOccurrencesQuery>,
) -> Result<Json<OccurrencesResponse>, ApiError> {
    if query.resource.is_empty() {
        return Err(ApiError::BadRequest("Resource URI cannot be empty".into()));
    }

    let occurrences = state.wrapper.list_occurrences(&query.resource).await?;
    Ok(Json(occurrences.into()))
}
