//! Kubernetes admission webhook
//!
//! Decodes an `admission.k8s.io/v1` AdmissionReview, enforces every container
//! image of an embedded Pod and answers with an AdmissionReview carrying the
//! decision. Anything that cannot be decoded is denied.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::enforcer::Enforcer;
use crate::error::{GateError, Result};

pub const ADMISSION_API_VERSION: &str = "admission.k8s.io/v1";
pub const ADMISSION_KIND: &str = "AdmissionReview";

/// Admission review envelope, used for both request and response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub object: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

/// The parts of a Pod the enforcer reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default)]
    pub init_containers: Vec<Container>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    pub image: String,
}

impl Pod {
    /// Image references of every init and regular container
    pub fn images(&self) -> impl Iterator<Item = &str> {
        self.spec
            .init_containers
            .iter()
            .chain(self.spec.containers.iter())
            .map(|c| c.image.as_str())
    }
}

impl AdmissionResponse {
    pub fn allow(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: true,
            status: None,
        }
    }

    pub fn deny(uid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            allowed: false,
            status: Some(Status {
                code: 403,
                message: message.into(),
            }),
        }
    }
}

impl AdmissionReview {
    pub fn from_response(response: AdmissionResponse) -> Self {
        Self {
            api_version: ADMISSION_API_VERSION.to_string(),
            kind: ADMISSION_KIND.to_string(),
            request: None,
            response: Some(response),
        }
    }
}

/// Answer the AdmissionReview in `body`
pub async fn review(enforcer: &Enforcer, body: &[u8]) -> AdmissionReview {
    let request = match decode_request(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejecting undecodable admission review");
            return AdmissionReview::from_response(AdmissionResponse::deny("", e.to_string()));
        }
    };

    let uid = request.uid.clone();
    let response = match admit(enforcer, &request).await {
        Ok(()) => AdmissionResponse::allow(uid),
        Err(e) => AdmissionResponse::deny(uid, e.to_string()),
    };
    AdmissionReview::from_response(response)
}

fn decode_request(body: &[u8]) -> Result<AdmissionRequest> {
    let review: AdmissionReview =
        serde_json::from_slice(body).map_err(|e| GateError::Decode(e.to_string()))?;
    review
        .request
        .ok_or_else(|| GateError::Decode("review carries no request".to_string()))
}

async fn admit(enforcer: &Enforcer, request: &AdmissionRequest) -> Result<()> {
    if request.kind.kind != "Pod" || !request.kind.group.is_empty() {
        debug!(uid = %request.uid, kind = %request.kind.kind, "Not a pod, allowing");
        return Ok(());
    }

    let object = request
        .object
        .clone()
        .ok_or_else(|| GateError::Decode("pod review carries no object".to_string()))?;
    let pod: Pod = serde_json::from_value(object).map_err(|e| GateError::Decode(e.to_string()))?;

    let namespace = request
        .namespace
        .as_deref()
        .or(pod.metadata.namespace.as_deref())
        .unwrap_or("default");

    for image in pod.images() {
        enforcer.enforce(namespace, image).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use attest_core::{AttesterRegistry, MemoryStore};
    use serde_json::json;

    use crate::enforcer::namespace::{Labels, StaticNamespaces};
    use crate::enforcer::resource::EnforcerDirectory;
    use crate::enforcer::{AttesterResolution, EnforcerConfig};

    const LABEL: &str = "attest-gate.io/attesters";

    fn enforcer_requiring(namespace: &str, attesters: &str) -> Enforcer {
        let namespaces = StaticNamespaces::new();
        namespaces.set_labels(
            namespace,
            Labels::from([(LABEL.to_string(), attesters.to_string())]),
        );
        Enforcer::new(
            EnforcerConfig {
                excluded_namespaces: BTreeSet::new(),
                resolution: AttesterResolution::NamespaceLabel(LABEL.to_string()),
            },
            Arc::new(MemoryStore::new()),
            Arc::new(AttesterRegistry::new()),
            Arc::new(namespaces),
            Arc::new(EnforcerDirectory::new()),
        )
    }

    fn pod_review(group: &str, kind: &str, namespace: &str, images: &[&str]) -> Vec<u8> {
        let containers: Vec<Value> = images
            .iter()
            .enumerate()
            .map(|(i, image)| json!({"name": format!("c{}", i), "image": image}))
            .collect();
        serde_json::to_vec(&json!({
            "apiVersion": ADMISSION_API_VERSION,
            "kind": ADMISSION_KIND,
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": {"group": group, "version": "v1", "kind": kind},
                "namespace": namespace,
                "operation": "CREATE",
                "object": {
                    "metadata": {"name": "app"},
                    "spec": {"containers": containers}
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_undecodable_review_denied() {
        let enforcer = enforcer_requiring("prod", "harbor");
        let review = review(&enforcer, b"not json").await;

        let response = review.response.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.status.unwrap().code, 403);
    }

    #[tokio::test]
    async fn test_missing_request_denied() {
        let enforcer = enforcer_requiring("prod", "harbor");
        let body = serde_json::to_vec(&json!({
            "apiVersion": ADMISSION_API_VERSION,
            "kind": ADMISSION_KIND
        }))
        .unwrap();

        assert!(!review(&enforcer, &body).await.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_non_pod_kinds_allowed() {
        let enforcer = enforcer_requiring("prod", "harbor");

        let deployment = pod_review("apps", "Deployment", "prod", &["repo/app:1"]);
        assert!(review(&enforcer, &deployment).await.response.unwrap().allowed);

        let grouped_pod = pod_review("example.io", "Pod", "prod", &["repo/app:1"]);
        assert!(review(&enforcer, &grouped_pod).await.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_unattested_pod_denied_with_reason() {
        let enforcer = enforcer_requiring("prod", "harbor");
        let body = pod_review("", "Pod", "prod", &["repo/app@sha256:1"]);

        let review = review(&enforcer, &body).await;
        assert_eq!(review.api_version, ADMISSION_API_VERSION);
        let response = review.response.unwrap();
        assert_eq!(response.uid, "705ab4f5-6393-11e8-b7cc-42010a800002");
        assert!(!response.allowed);
        assert!(response.status.unwrap().message.contains("harbor"));
    }

    #[tokio::test]
    async fn test_pod_in_unrestricted_namespace_allowed() {
        let enforcer = enforcer_requiring("prod", "harbor");
        let body = pod_review("", "Pod", "dev", &["repo/app@sha256:1", "repo/side@sha256:2"]);

        assert!(review(&enforcer, &body).await.response.unwrap().allowed);
    }

    #[test]
    fn test_images_include_init_containers() {
        let pod: Pod = serde_json::from_value(json!({
            "spec": {
                "initContainers": [{"name": "init", "image": "repo/init:1"}],
                "containers": [{"name": "app", "image": "repo/app:1"}]
            }
        }))
        .unwrap();

        assert_eq!(pod.images().collect::<Vec<_>>(), vec!["repo/init:1", "repo/app:1"]);
    }

    #[test]
    fn test_response_shape() {
        let review = AdmissionReview::from_response(AdmissionResponse::deny("abc", "no"));
        let value = serde_json::to_value(&review).unwrap();
        assert_eq!(value["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(value["response"]["allowed"], false);
        assert_eq!(value["response"]["status"]["message"], "no");
        assert!(value.get("request").is_none());
    }
}
