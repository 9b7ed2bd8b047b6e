//! # Attest Core
//!
//! Attestation primitives for container images: the occurrence model, policy
//! evaluation, signing, attesters and the orchestrator that attests resources
//! as new facts about them are recorded.
//!
//! ## Key Concepts
//!
//! - **Occurrence**: an immutable fact about a resource (discovery result,
//!   vulnerability, or attestation)
//! - **Policy**: a compiled Rego module evaluated over every occurrence of a
//!   resource, producing violations
//! - **Signer**: an Ed25519 key pair producing self-contained COSE_Sign1
//!   signatures, identified by a key ID derived from the public key
//! - **Attester**: a named (policy, signer) pair that signs resources its
//!   policy finds compliant
//! - **AttestWrapper**: persists new occurrences, then re-attests every
//!   affected resource across all registered attesters

pub mod attester;
mod encoding;
pub mod error;
pub mod message;
pub mod occurrence;
pub mod orchestrator;
pub mod policy;
pub mod registry;
pub mod signer;
pub mod store;

pub use attester::{AttestRequest, AttestResponse, Attester};
pub use error::{AttestError, Result, VerificationError, ViolationError};
pub use message::AttestationMessage;
pub use occurrence::{
    AnalysisStatus, NoteKind, Occurrence, PackageIssue, Resource, Severity, VulnerabilityDetails,
    VulnerabilityLocation,
};
pub use orchestrator::{AttestWrapper, AttestationPublisher};
pub use policy::{PolicyEvaluator, PolicyInput, RegoPolicy, Violation};
pub use registry::AttesterRegistry;
pub use signer::Signer;
pub use store::{MemoryStore, OccurrenceStore, StoreError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
