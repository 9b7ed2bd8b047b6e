//! Attesters: named (policy, signer) pairs
//!
//! An attester evaluates its policy over every known occurrence of a resource
//! and, when the policy reports nothing, signs the resource URI. The signature
//! claims only that this resource URI was evaluated clean by this attester
//! under this key.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, VerificationError, ViolationError};
use crate::occurrence::{attester_note_name, Occurrence};
use crate::policy::{PolicyEvaluator, PolicyInput};
use crate::signer::Signer;

/// Request to attest a resource
#[derive(Debug, Clone)]
pub struct AttestRequest {
    /// Resource being attested
    pub resource_uri: String,
    /// Every known occurrence for the resource
    pub occurrences: Vec<Occurrence>,
}

/// A successful attestation
#[derive(Debug, Clone)]
pub struct AttestResponse {
    /// Signed attestation occurrence, not yet persisted
    pub attestation: Occurrence,
}

/// A named policy bound to a signer
pub struct Attester {
    name: String,
    policy: Box<dyn PolicyEvaluator>,
    signer: Arc<Signer>,
}

impl std::fmt::Debug for Attester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attester")
            .field("name", &self.name)
            .field("policy", &self.policy.name())
            .field("key_id", &self.signer.key_id())
            .finish()
    }
}

impl Attester {
    pub fn new(
        name: impl Into<String>,
        policy: Box<dyn PolicyEvaluator>,
        signer: Arc<Signer>,
    ) -> Self {
        Self {
            name: name.into(),
            policy,
            signer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    pub fn signer(&self) -> &Arc<Signer> {
        &self.signer
    }

    /// Note name attestations from this attester are filed under
    pub fn note_name(&self) -> String {
        attester_note_name(&self.name)
    }

    /// Evaluate the policy and sign the resource if it is compliant.
    ///
    /// # Errors
    /// * `AttestError::Violation` carrying every violation when the policy
    ///   rejects the resource; nothing is signed in that case
    /// * `AttestError::Signing` / `AttestError::Serialization` on failure to
    ///   build the attestation
    pub fn attest(&self, request: &AttestRequest) -> Result<AttestResponse> {
        let input = PolicyInput::from_occurrences(&request.occurrences)?;
        let violations = self.policy.evaluate(&input);

        if !violations.is_empty() {
            debug!(
                attester = %self.name,
                resource = %request.resource_uri,
                violations = violations.len(),
                "Policy reported violations"
            );
            return Err(ViolationError {
                attester: self.name.clone(),
                violations,
            }
            .into());
        }

        let signature = self.signer.sign(request.resource_uri.as_bytes())?;
        let attestation = Occurrence::attestation(
            request.resource_uri.clone(),
            self.note_name(),
            signature,
            self.signer.key_id(),
        );

        info!(
            attester = %self.name,
            resource = %request.resource_uri,
            key_id = %self.signer.key_id(),
            "Resource attested"
        );

        Ok(AttestResponse { attestation })
    }

    /// Check that `occurrence` is a valid attestation from this attester.
    pub fn verify(&self, occurrence: &Occurrence) -> std::result::Result<(), VerificationError> {
        let signature = occurrence
            .attestation_signature()
            .ok_or_else(|| VerificationError::NotAttestation(occurrence.name.clone()))?;

        if signature.public_key_id != self.signer.key_id() {
            return Err(VerificationError::KeyMismatch {
                expected: self.signer.key_id().to_string(),
                actual: signature.public_key_id.clone(),
            });
        }

        let body = self.signer.verify(&signature.signature)?;
        if body != occurrence.resource_uri().as_bytes() {
            return Err(VerificationError::SubjectMismatch {
                expected: occurrence.resource_uri().to_string(),
                actual: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(())
    }
}
