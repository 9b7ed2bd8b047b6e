//! Admission-time enforcement
//!
//! The enforcer decides whether a resource may run in a namespace: every
//! attester required for the namespace must have at least one attestation
//! for the resource that verifies under that attester's key.

pub mod namespace;
pub mod resource;

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use attest_core::{AttesterRegistry, Occurrence, OccurrenceStore};

use crate::config::{split_list, GateConfig, Resolution};
use crate::error::{GateError, Result};
use namespace::NamespaceDirectory;
use resource::{
    Condition, ConditionStatus, EnforcerDirectory, EnforcerResource, CONDITION_ATTESTERS_RESOLVED,
    CONDITION_READY,
};

/// Where required attesters are read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttesterResolution {
    /// Comma-separated attester names in this namespace label
    NamespaceLabel(String),
    /// Enforcer resources applying to the namespace
    EnforcerResources,
}

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub excluded_namespaces: BTreeSet<String>,
    pub resolution: AttesterResolution,
}

impl From<&GateConfig> for EnforcerConfig {
    fn from(config: &GateConfig) -> Self {
        let resolution = match config.resolution {
            Resolution::Labels => AttesterResolution::NamespaceLabel(config.attester_label.clone()),
            Resolution::Enforcers => AttesterResolution::EnforcerResources,
        };
        Self {
            excluded_namespaces: config.excluded_namespaces.iter().cloned().collect(),
            resolution,
        }
    }
}

/// Admission decision maker
#[derive(Debug, Clone)]
pub struct Enforcer {
    config: EnforcerConfig,
    store: Arc<dyn OccurrenceStore>,
    registry: Arc<AttesterRegistry>,
    namespaces: Arc<dyn NamespaceDirectory>,
    enforcers: Arc<EnforcerDirectory>,
}

impl Enforcer {
    pub fn new(
        config: EnforcerConfig,
        store: Arc<dyn OccurrenceStore>,
        registry: Arc<AttesterRegistry>,
        namespaces: Arc<dyn NamespaceDirectory>,
        enforcers: Arc<EnforcerDirectory>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            namespaces,
            enforcers,
        }
    }

    pub fn is_excluded(&self, namespace: &str) -> bool {
        self.config.excluded_namespaces.contains(namespace)
    }

    /// Allow `resource_uri` in `namespace` or explain why not.
    ///
    /// # Errors
    /// * `GateError::UnknownAttester` when a required attester is not registered
    /// * `GateError::NotAttested` naming the first required attester without a
    ///   verified attestation
    /// * `GateError::Store` when the resource's attestations cannot be listed,
    ///   or any error of the namespace directory
    pub async fn enforce(&self, namespace: &str, resource_uri: &str) -> Result<()> {
        if self.is_excluded(namespace) {
            debug!(namespace = %namespace, resource = %resource_uri, "Namespace excluded from enforcement");
            return Ok(());
        }

        let required = self.required_attesters(namespace).await?;
        if required.is_empty() {
            debug!(namespace = %namespace, resource = %resource_uri, "No attesters required");
            return Ok(());
        }

        if let Some(unknown) = required.iter().find(|name| !self.registry.contains(name)) {
            warn!(namespace = %namespace, attester = %unknown, "Required attester is not registered");
            return Err(GateError::UnknownAttester(unknown.clone()));
        }

        let occurrences = self.store.list_occurrences(resource_uri).await?;
        let verified = self.verified_attesters(&occurrences);

        for attester in &required {
            if !verified.contains(attester) {
                info!(
                    namespace = %namespace,
                    resource = %resource_uri,
                    attester = %attester,
                    "Admission denied"
                );
                return Err(GateError::NotAttested {
                    resource: resource_uri.to_string(),
                    attester: attester.clone(),
                });
            }
        }

        info!(
            namespace = %namespace,
            resource = %resource_uri,
            attesters = required.len(),
            "Admission allowed"
        );
        Ok(())
    }

    /// Attesters required for `namespace`, deduplicated and ordered by name
    pub async fn required_attesters(&self, namespace: &str) -> Result<BTreeSet<String>> {
        match &self.config.resolution {
            AttesterResolution::NamespaceLabel(label) => {
                let labels = self.namespaces.labels(namespace).await?;
                Ok(labels
                    .get(label)
                    .map(|value| split_list(value).into_iter().collect())
                    .unwrap_or_default())
            }
            AttesterResolution::EnforcerResources => {
                let mut required = BTreeSet::new();
                for resource in self.enforcers.applicable(namespace) {
                    self.refresh_conditions(resource.as_ref());
                    required.extend(resource.required_attesters().iter().cloned());
                }
                Ok(required)
            }
        }
    }

    /// Names of attesters with at least one verified attestation among
    /// `occurrences`
    fn verified_attesters(&self, occurrences: &[Occurrence]) -> BTreeSet<String> {
        let mut verified = BTreeSet::new();
        for occurrence in occurrences {
            let Some(signature) = occurrence.attestation_signature() else {
                continue;
            };
            let candidates = self.registry.find_by_key_id(&signature.public_key_id);
            for (name, attester) in candidates.get_all() {
                if verified.contains(&name) {
                    continue;
                }
                match attester.verify(occurrence) {
                    Ok(()) => {
                        verified.insert(name);
                    }
                    Err(e) => {
                        debug!(
                            attester = %name,
                            occurrence = %occurrence.name,
                            error = %e,
                            "Attestation did not verify"
                        );
                    }
                }
            }
        }
        verified
    }

    /// Update `resource`'s conditions from the current registry
    pub fn refresh_conditions(&self, resource: &dyn EnforcerResource) {
        resource.set_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Applied",
            "",
        ));

        let missing: Vec<&str> = resource
            .required_attesters()
            .iter()
            .filter(|name| !self.registry.contains(name))
            .map(String::as_str)
            .collect();

        let condition = if missing.is_empty() {
            Condition::new(
                CONDITION_ATTESTERS_RESOLVED,
                ConditionStatus::True,
                "AllRegistered",
                "",
            )
        } else {
            Condition::new(
                CONDITION_ATTESTERS_RESOLVED,
                ConditionStatus::False,
                "AttesterNotFound",
                format!("attesters not registered: {}", missing.join(", ")),
            )
        };
        resource.set_condition(condition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use attest_core::{
        AnalysisStatus, AttestWrapper, Attester, MemoryStore, PolicyEvaluator, PolicyInput,
        Signer, StoreError, Violation,
    };

    use super::namespace::{Labels, StaticNamespaces};
    use super::resource::{EnforcerSpec, MatchStrategy};

    const LABEL: &str = "attest-gate.io/attesters";

    struct ScanSucceeded;

    impl PolicyEvaluator for ScanSucceeded {
        fn name(&self) -> &str {
            "scan-succeeded"
        }

        fn evaluate(&self, input: &PolicyInput) -> Vec<Violation> {
            let failed = input.occurrences.iter().any(|o| {
                o["discovered"]["discovered"]["analysisStatus"] == "FINISHED_FAILED"
            });
            let succeeded = input.occurrences.iter().any(|o| {
                o["discovered"]["discovered"]["analysisStatus"] == "FINISHED_SUCCESS"
            });
            if failed && !succeeded {
                vec![Violation::from_result("analysis failed".into())]
            } else if !succeeded {
                vec![Violation::from_result("no successful analysis".into())]
            } else {
                Vec::new()
            }
        }
    }

    #[derive(Debug, Default)]
    struct CountingStore {
        inner: MemoryStore,
        lists: AtomicUsize,
    }

    #[async_trait]
    impl OccurrenceStore for CountingStore {
        async fn create_occurrences(
            &self,
            occurrences: Vec<Occurrence>,
        ) -> std::result::Result<Vec<Occurrence>, StoreError> {
            self.inner.create_occurrences(occurrences).await
        }

        async fn list_occurrences(
            &self,
            resource_uri: &str,
        ) -> std::result::Result<Vec<Occurrence>, StoreError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            self.inner.list_occurrences(resource_uri).await
        }
    }

    struct Fixture {
        store: Arc<CountingStore>,
        registry: Arc<AttesterRegistry>,
        namespaces: Arc<StaticNamespaces>,
        enforcers: Arc<EnforcerDirectory>,
    }

    impl Fixture {
        fn new(attesters: &[&str]) -> Self {
            let registry = Arc::new(AttesterRegistry::new());
            for name in attesters {
                registry.add(Arc::new(Attester::new(
                    *name,
                    Box::new(ScanSucceeded),
                    Arc::new(Signer::generate(*name)),
                )));
            }
            Self {
                store: Arc::new(CountingStore::default()),
                registry,
                namespaces: Arc::new(StaticNamespaces::new()),
                enforcers: Arc::new(EnforcerDirectory::new()),
            }
        }

        fn enforcer(&self, resolution: AttesterResolution) -> Enforcer {
            Enforcer::new(
                EnforcerConfig {
                    excluded_namespaces: BTreeSet::from(["kube-system".to_string()]),
                    resolution,
                },
                self.store.clone(),
                self.registry.clone(),
                self.namespaces.clone(),
                self.enforcers.clone(),
            )
        }

        fn label_enforcer(&self) -> Enforcer {
            self.enforcer(AttesterResolution::NamespaceLabel(LABEL.to_string()))
        }

        fn require(&self, namespace: &str, attesters: &str) {
            self.namespaces.set_labels(
                namespace,
                Labels::from([(LABEL.to_string(), attesters.to_string())]),
            );
        }

        fn wrapper(&self) -> AttestWrapper {
            AttestWrapper::new(self.store.clone(), self.registry.clone())
        }
    }

    const IMAGE: &str = "repo/img@sha256:abc";

    #[tokio::test]
    async fn test_failed_scan_denied_then_allowed_after_success() {
        let fixture = Fixture::new(&["harbor"]);
        fixture.require("prod", "harbor");
        let enforcer = fixture.label_enforcer();
        let wrapper = fixture.wrapper();

        wrapper
            .create_occurrences(vec![Occurrence::discovery(
                IMAGE,
                "notes/scan",
                AnalysisStatus::FinishedFailed,
            )])
            .await
            .unwrap();

        let err = enforcer.enforce("prod", IMAGE).await.unwrap_err();
        assert!(err.is_denial());
        assert!(err.to_string().contains("harbor"));

        wrapper
            .create_occurrences(vec![Occurrence::discovery(
                IMAGE,
                "notes/scan",
                AnalysisStatus::FinishedSuccess,
            )])
            .await
            .unwrap();

        enforcer.enforce("prod", IMAGE).await.unwrap();
    }

    #[tokio::test]
    async fn test_excluded_namespace_skips_store() {
        let fixture = Fixture::new(&["harbor"]);
        fixture.require("kube-system", "harbor");
        let enforcer = fixture.label_enforcer();

        enforcer.enforce("kube-system", "anything").await.unwrap();
        assert_eq!(fixture.store.lists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_namespace_without_requirements_allows() {
        let fixture = Fixture::new(&["harbor"]);
        let enforcer = fixture.label_enforcer();

        enforcer.enforce("dev", IMAGE).await.unwrap();
        assert_eq!(fixture.store.lists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregistered_attester_denies() {
        let fixture = Fixture::new(&["harbor"]);
        fixture.require("prod", "harbor, cves");
        let enforcer = fixture.label_enforcer();

        let err = enforcer.enforce("prod", IMAGE).await.unwrap_err();
        assert!(matches!(err, GateError::UnknownAttester(ref name) if name == "cves"));
    }

    #[tokio::test]
    async fn test_every_required_attester_must_verify() {
        let fixture = Fixture::new(&["harbor", "cves"]);
        fixture.require("prod", "harbor,cves");
        let enforcer = fixture.label_enforcer();

        // Only harbor signs the resource
        let harbor = fixture.registry.get("harbor").unwrap();
        let attestation = harbor
            .attest(&attest_core::AttestRequest {
                resource_uri: IMAGE.to_string(),
                occurrences: vec![Occurrence::discovery(
                    IMAGE,
                    "notes/scan",
                    AnalysisStatus::FinishedSuccess,
                )],
            })
            .unwrap()
            .attestation;
        fixture.store.create_occurrences(vec![attestation]).await.unwrap();

        let err = enforcer.enforce("prod", IMAGE).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::NotAttested { ref attester, .. } if attester == "cves"
        ));
    }

    #[tokio::test]
    async fn test_forged_attestation_rejected() {
        let fixture = Fixture::new(&["harbor"]);
        fixture.require("prod", "harbor");
        let enforcer = fixture.label_enforcer();

        // Signed by a different key that claims harbor's key ID
        let impostor = Signer::generate("harbor");
        let harbor_key = fixture.registry.get("harbor").unwrap().signer().key_id().to_string();
        let forged = Occurrence::attestation(
            IMAGE,
            "projects/attest-gate/notes/harbor",
            impostor.sign(IMAGE.as_bytes()).unwrap(),
            harbor_key,
        );
        fixture.store.create_occurrences(vec![forged]).await.unwrap();

        assert!(enforcer.enforce("prod", IMAGE).await.is_err());
    }

    #[tokio::test]
    async fn test_attestation_for_other_resource_rejected() {
        let fixture = Fixture::new(&["harbor"]);
        fixture.require("prod", "harbor");
        let enforcer = fixture.label_enforcer();

        // Valid signature, but over a different resource URI
        let signer = fixture.registry.get("harbor").unwrap().signer().clone();
        let misplaced = Occurrence::attestation(
            IMAGE,
            "projects/attest-gate/notes/harbor",
            signer.sign(b"repo/other@sha256:def").unwrap(),
            signer.key_id(),
        );
        fixture.store.create_occurrences(vec![misplaced]).await.unwrap();

        assert!(enforcer.enforce("prod", IMAGE).await.is_err());
    }

    #[tokio::test]
    async fn test_cluster_enforcer_strategies() {
        let fixture = Fixture::new(&["harbor"]);
        let enforcer = fixture.enforcer(AttesterResolution::EnforcerResources);
        fixture.enforcers.apply(EnforcerSpec {
            name: "all-but-dev".into(),
            namespace: None,
            attesters: vec!["harbor".into()],
            strategy: MatchStrategy::Exclude,
            namespaces: vec!["dev".into()],
        });

        enforcer.enforce("dev", IMAGE).await.unwrap();
        assert!(enforcer.enforce("prod", IMAGE).await.unwrap_err().is_denial());
    }

    #[tokio::test]
    async fn test_resolution_updates_conditions() {
        let fixture = Fixture::new(&["harbor"]);
        let enforcer = fixture.enforcer(AttesterResolution::EnforcerResources);
        let resource = fixture.enforcers.apply(EnforcerSpec {
            name: "prod-gate".into(),
            namespace: Some("prod".into()),
            attesters: vec!["harbor".into(), "cves".into()],
            strategy: MatchStrategy::Include,
            namespaces: vec![],
        });

        let required = enforcer.required_attesters("prod").await.unwrap();
        assert_eq!(
            required.into_iter().collect::<Vec<_>>(),
            vec!["cves".to_string(), "harbor".to_string()]
        );

        let conditions = resource.conditions();
        let resolved = conditions
            .iter()
            .find(|c| c.condition_type == CONDITION_ATTESTERS_RESOLVED)
            .unwrap();
        assert_eq!(resolved.status, ConditionStatus::False);
        assert!(resolved.message.contains("cves"));
    }
}
