//! Attestation orchestration
//!
//! [`AttestWrapper`] wraps a fact store's create path. New occurrences are
//! persisted first, then every distinct affected resource is re-attested by
//! every registered attester over the resource's full history. A policy
//! violation never blocks persistence of the facts that triggered it.

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::attester::{AttestRequest, Attester};
use crate::error::{AttestError, Result};
use crate::occurrence::Occurrence;
use crate::registry::AttesterRegistry;
use crate::store::OccurrenceStore;

/// Destination for attestations produced by the orchestrator
///
/// Implemented by the event manager so that enforcement processes learn of
/// new attestations without polling the store.
#[async_trait]
pub trait AttestationPublisher: Send + Sync + Debug {
    async fn publish_attestation(&self, attester: &str, attestation: &Occurrence) -> Result<()>;
}

/// Fact store wrapper that attests resources as facts about them arrive
#[derive(Debug, Clone)]
pub struct AttestWrapper {
    store: Arc<dyn OccurrenceStore>,
    registry: Arc<AttesterRegistry>,
    publisher: Option<Arc<dyn AttestationPublisher>>,
}

impl AttestWrapper {
    pub fn new(store: Arc<dyn OccurrenceStore>, registry: Arc<AttesterRegistry>) -> Self {
        Self {
            store,
            registry,
            publisher: None,
        }
    }

    /// Also publish every persisted attestation through `publisher`
    pub fn with_publisher(mut self, publisher: Arc<dyn AttestationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn store(&self) -> &Arc<dyn OccurrenceStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AttesterRegistry> {
        &self.registry
    }

    /// Persist `occurrences`, then attest each affected resource.
    ///
    /// Returns the stored input occurrences. Attestations are persisted
    /// through the wrapped store directly and are not part of the result.
    ///
    /// A failure while attesting one resource with one attester is logged
    /// and the remaining pairs are still attempted. The first such failure is
    /// returned once every pair has been tried.
    ///
    /// # Errors
    /// * `AttestError::Store` if the input or an attestation fails to persist,
    ///   or a resource's history cannot be listed
    /// * `AttestError::Publish` if a persisted attestation cannot be published
    ///
    /// Policy violations are logged and never returned.
    pub async fn create_occurrences(&self, occurrences: Vec<Occurrence>) -> Result<Vec<Occurrence>> {
        if occurrences.is_empty() {
            return Ok(Vec::new());
        }

        let created = self.store.create_occurrences(occurrences).await?;

        let mut seen = HashSet::new();
        let resources: Vec<String> = created
            .iter()
            .map(|o| o.resource_uri().to_string())
            .filter(|uri| seen.insert(uri.clone()))
            .collect();

        debug!(
            occurrences = created.len(),
            resources = resources.len(),
            "Persisted occurrences, attesting resources"
        );

        let mut failures = Vec::new();
        for resource_uri in resources {
            failures.extend(self.attest_resource(resource_uri).await);
        }

        match failures.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(created),
        }
    }

    /// Attest `resource_uri` with every registered attester, returning the
    /// failures of the attesters that could not complete
    async fn attest_resource(&self, resource_uri: String) -> Vec<AttestError> {
        let history = match self.store.list_occurrences(&resource_uri).await {
            Ok(history) => history,
            Err(err) => {
                error!(resource = %resource_uri, error = %err, "Failed to list resource history");
                return vec![err.into()];
            }
        };
        let request = Arc::new(AttestRequest {
            resource_uri,
            occurrences: history,
        });

        let mut failures = Vec::new();
        for (name, attester) in self.registry.get_all() {
            match self.attest_with(&name, attester, request.clone()).await {
                Ok(()) => {}
                Err(AttestError::Violation(err)) => {
                    warn!(
                        attester = %name,
                        resource = %request.resource_uri,
                        violations = err.violations.len(),
                        error = %err,
                        "Attestation failed"
                    );
                }
                Err(err) => {
                    error!(
                        attester = %name,
                        resource = %request.resource_uri,
                        error = %err,
                        "Attestation error"
                    );
                    failures.push(err);
                }
            }
        }
        failures
    }

    async fn attest_with(
        &self,
        name: &str,
        attester: Arc<Attester>,
        request: Arc<AttestRequest>,
    ) -> Result<()> {
        // Policy evaluation and signing are CPU-bound
        let task_request = request.clone();
        let response = tokio::task::spawn_blocking(move || attester.attest(&task_request))
            .await
            .map_err(|e| AttestError::Task(e.to_string()))??;

        let stored = self
            .store
            .create_occurrences(vec![response.attestation])
            .await?;

        if let Some(publisher) = &self.publisher {
            for attestation in &stored {
                publisher.publish_attestation(name, attestation).await?;
            }
        }

        info!(
            attester = %name,
            resource = %request.resource_uri,
            "Attestation persisted"
        );
        Ok(())
    }

    /// Every occurrence recorded for `resource_uri`
    pub async fn list_occurrences(&self, resource_uri: &str) -> Result<Vec<Occurrence>> {
        Ok(self.store.list_occurrences(resource_uri).await?)
    }
}
