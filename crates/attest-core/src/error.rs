//! Error types for attestation

use thiserror::Error;

use crate::policy::Violation;
use crate::store::StoreError;

/// Result type alias using AttestError
pub type Result<T> = std::result::Result<T, AttestError>;

/// Errors that can occur while evaluating, signing or orchestrating attestations
#[derive(Error, Debug)]
pub enum AttestError {
    /// The policy module could not be compiled
    #[error("Policy '{policy}' failed to compile: {message}")]
    PolicyCompile { policy: String, message: String },

    /// The policy rejected the resource
    #[error(transparent)]
    Violation(#[from] ViolationError),

    /// Signing failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// Signature or attestation verification failed
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// The fact store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Publishing an attestation to the event stream failed
    #[error("Publish error: {0}")]
    Publish(String),

    /// Serialized key material could not be restored
    #[error("Key material error: {0}")]
    KeyMaterial(String),

    /// Occurrence does not have the shape required by the operation
    #[error("Invalid occurrence: {0}")]
    InvalidOccurrence(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A blocking attestation task panicked or was cancelled
    #[error("Attestation task failed: {0}")]
    Task(String),
}

impl AttestError {
    /// Whether this error is a policy outcome rather than a system failure
    pub fn is_violation(&self) -> bool {
        matches!(self, AttestError::Violation(_))
    }
}

/// A policy evaluated a resource and found it non-compliant.
#[derive(Error, Debug, Clone)]
#[error("{} policy violation(s) for attester '{attester}': {}", .violations.len(), summarize(.violations))]
pub struct ViolationError {
    /// Attester whose policy produced the violations
    pub attester: String,
    /// Every violation the policy reported
    pub violations: Vec<Violation>,
}

fn summarize(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| v.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Signature verification failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    /// The signature bytes are not a well-formed signed message
    #[error("Malformed signature encoding: {0}")]
    Encoding(String),

    /// The signature was produced by a different key
    #[error("Key ID mismatch: expected '{expected}', got '{actual}'")]
    KeyMismatch { expected: String, actual: String },

    /// The signed body or signature was altered
    #[error("Signature does not match signed content")]
    SignatureMismatch,

    /// The signed message carries no body
    #[error("Signed message has no payload")]
    MissingPayload,

    /// The occurrence is not an attestation
    #[error("Occurrence '{0}' is not an attestation")]
    NotAttestation(String),

    /// The signature is valid but covers a different resource
    #[error("Attestation subject mismatch: expected '{expected}', signed '{actual}'")]
    SubjectMismatch { expected: String, actual: String },
}

impl From<serde_json::Error> for AttestError {
    fn from(err: serde_json::Error) -> Self {
        AttestError::Serialization(err.to_string())
    }
}

impl From<coset::CoseError> for AttestError {
    fn from(err: coset::CoseError) -> Self {
        AttestError::Signing(format!("{:?}", err))
    }
}

impl From<ed25519_dalek::SignatureError> for AttestError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        AttestError::KeyMaterial(err.to_string())
    }
}

impl From<base64::DecodeError> for AttestError {
    fn from(err: base64::DecodeError) -> Self {
        AttestError::KeyMaterial(format!("Invalid base64 encoding: {}", err))
    }
}
