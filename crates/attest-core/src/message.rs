//! Wire form of attestation occurrences
//!
//! An attestation travels as its occurrence with the signature removed, plus
//! the signature bytes and key ID as separate top-level fields. The receiver
//! reassembles the exact original occurrence from the three parts.

use serde::{Deserialize, Serialize};

use crate::encoding::base64_bytes;
use crate::error::{AttestError, Result};
use crate::occurrence::{Occurrence, Signature};

/// A decomposed attestation occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttestationMessage {
    /// The occurrence with its signature list cleared
    pub occurrence: Occurrence,

    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,

    pub key_id: String,
}

impl AttestationMessage {
    /// Split an attestation occurrence into body, signature and key ID.
    ///
    /// Only occurrences carrying exactly one signature can be decomposed
    /// losslessly.
    pub fn from_occurrence(occurrence: &Occurrence) -> Result<Self> {
        let mut body = occurrence.clone();
        let generic = body.generic_attestation_mut().ok_or_else(|| {
            AttestError::InvalidOccurrence(format!(
                "'{}' is not an attestation",
                occurrence.note_name
            ))
        })?;

        let signatures = std::mem::take(&mut generic.signatures);
        let [Signature {
            signature,
            public_key_id,
        }]: [Signature; 1] = signatures.try_into().map_err(|s: Vec<Signature>| {
            AttestError::InvalidOccurrence(format!(
                "expected exactly one signature, found {}",
                s.len()
            ))
        })?;

        Ok(Self {
            occurrence: body,
            signature,
            key_id: public_key_id,
        })
    }

    /// Reassemble the original occurrence
    pub fn into_occurrence(self) -> Result<Occurrence> {
        let mut occurrence = self.occurrence;
        let generic = occurrence.generic_attestation_mut().ok_or_else(|| {
            AttestError::InvalidOccurrence("message body has no attestation details".into())
        })?;

        if !generic.signatures.is_empty() {
            return Err(AttestError::InvalidOccurrence(
                "message body still carries signatures".into(),
            ));
        }
        generic.signatures.push(Signature {
            signature: self.signature,
            public_key_id: self.key_id,
        });

        Ok(occurrence)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
