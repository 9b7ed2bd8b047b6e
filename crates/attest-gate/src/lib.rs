//! Attestation Gate
//!
//! The attestation gate records facts about container images, attests them
//! with the registered attesters, distributes attestations over the event
//! stream, and enforces them when pods are admitted:
//! - New occurrences are re-attested by every attester
//! - Attestations are published per attester and, when ingestion is enabled,
//!   consumed back into the local store
//! - Pods are admitted only when every required attester has a verified
//!   attestation for each container image
//!
//! ## API Endpoints
//!
//! ### Service
//! - `GET /health` - Liveness check
//! - `GET /ready` - Readiness check with attester and consumer counts
//!
//! ### Attestation
//! - `POST /v1/occurrences` - Record occurrences and attest their resources
//! - `GET /v1/occurrences?resource=<uri>` - List a resource's occurrences
//! - `POST /v1/attesters` - Register an attester (policy + key)
//! - `GET /v1/attesters` - List attesters
//! - `GET /v1/attesters/{name}` - Get one attester
//! - `DELETE /v1/attesters/{name}` - Remove an attester
//!
//! ### Enforcement
//! - `POST /v1/enforcers` - Apply a namespaced or cluster enforcer
//! - `GET /v1/enforcers` - List enforcers with their conditions
//! - `DELETE /v1/enforcers/{name}?namespace=<ns>` - Remove an enforcer
//! - `PUT /v1/namespaces/{name}/labels` - Set a namespace's labels
//! - `POST /v1/enforce` - Check one resource against a namespace
//! - `POST /validate` - Kubernetes admission webhook

pub mod admission;
pub mod api;
pub mod config;
pub mod enforcer;
pub mod error;
pub mod grafeas;

pub use api::create_router;
pub use api::handlers::AppState;
pub use config::{GateConfig, Resolution};
pub use enforcer::{AttesterResolution, Enforcer, EnforcerConfig};
pub use error::{GateError, Result};
pub use grafeas::GrafeasStore;
