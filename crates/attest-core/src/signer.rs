//! Ed25519 signer producing COSE_Sign1 messages
//!
//! A signature is a complete COSE_Sign1 structure: the protected header names
//! the algorithm and key ID, and the signed body travels as the payload, so
//! `verify` needs nothing but the signature bytes to recover the message.
//!
//! Key IDs are the upper-case hex of the first 20 bytes of the SHA-256 digest
//! of the public key, so they survive restarts given the same key material.

use base64::{engine::general_purpose::STANDARD, Engine};
use coset::{iana, CborSerializable, CoseSign1, CoseSign1Builder, HeaderBuilder};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AttestError, Result, VerificationError};

/// COSE algorithm identifier for EdDSA (Ed25519)
const EDDSA_ALG: iana::Algorithm = iana::Algorithm::EdDSA;

/// Number of digest bytes forming a key ID
const KEY_ID_LEN: usize = 20;

/// An Ed25519 key pair bound to a human-readable name
#[derive(Clone)]
pub struct Signer {
    name: String,
    key_id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("name", &self.name)
            .field("key_id", &self.key_id)
            .field("signing_key", &"[redacted]")
            .finish()
    }
}

/// Persisted form of a signer's full key pair
#[derive(Debug, Serialize, Deserialize)]
struct SerializedKeys {
    name: String,
    key_id: String,
    /// Base64-encoded Ed25519 secret key
    secret_key: String,
}

/// Persisted form of a signer's public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedPublicKey {
    pub name: String,
    pub key_id: String,
    /// Base64-encoded Ed25519 public key
    pub public_key: String,
}

impl Signer {
    /// Generate a new random key pair
    pub fn generate(name: impl Into<String>) -> Self {
        Self::from_signing_key(name, SigningKey::generate(&mut OsRng))
    }

    /// Restore a signer from the output of [`Signer::serialize_keys`]
    pub fn from_serialized(bytes: &[u8]) -> Result<Self> {
        let stored: SerializedKeys = serde_json::from_slice(bytes)
            .map_err(|e| AttestError::KeyMaterial(format!("Invalid key document: {}", e)))?;

        let secret = STANDARD.decode(&stored.secret_key)?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| AttestError::KeyMaterial("Invalid secret key length".into()))?;

        let signer = Self::from_signing_key(stored.name, SigningKey::from_bytes(&secret));
        if signer.key_id != stored.key_id {
            return Err(AttestError::KeyMaterial(format!(
                "Key ID mismatch: document says '{}', key derives '{}'",
                stored.key_id, signer.key_id
            )));
        }

        Ok(signer)
    }

    fn from_signing_key(name: impl Into<String>, signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            name: name.into(),
            key_id: key_id_for(&verifying_key),
            signing_key,
            verifying_key,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identifier derived from the public key
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Sign `message`, returning a self-contained COSE_Sign1 encoding
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let protected = HeaderBuilder::new()
            .algorithm(EDDSA_ALG)
            .key_id(self.key_id.as_bytes().to_vec())
            .build();

        let cose = CoseSign1Builder::new()
            .protected(protected)
            .payload(message.to_vec())
            .try_create_signature(&[], |data| {
                Ok::<_, AttestError>(self.signing_key.sign(data).to_bytes().to_vec())
            })?
            .build();

        cose.to_vec().map_err(AttestError::from)
    }

    /// Verify a signature produced by this key and return the signed message
    pub fn verify(&self, signature: &[u8]) -> std::result::Result<Vec<u8>, VerificationError> {
        let cose = CoseSign1::from_slice(signature)
            .map_err(|e| VerificationError::Encoding(format!("{:?}", e)))?;

        let kid = String::from_utf8_lossy(&cose.protected.header.key_id);
        if kid != self.key_id {
            return Err(VerificationError::KeyMismatch {
                expected: self.key_id.clone(),
                actual: kid.into_owned(),
            });
        }

        let signature_bytes: [u8; 64] = cose
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| VerificationError::Encoding("Invalid signature length".into()))?;
        let tbs = cose.tbs_data(&[]);

        self.verifying_key
            .verify(&tbs, &Signature::from_bytes(&signature_bytes))
            .map_err(|_| VerificationError::SignatureMismatch)?;

        cose.payload.ok_or(VerificationError::MissingPayload)
    }

    /// Serialize the full key pair for persistence
    pub fn serialize_keys(&self) -> Result<Vec<u8>> {
        let stored = SerializedKeys {
            name: self.name.clone(),
            key_id: self.key_id.clone(),
            secret_key: STANDARD.encode(self.signing_key.to_bytes()),
        };
        Ok(serde_json::to_vec(&stored)?)
    }

    /// Serialize only the public half
    pub fn serialize_public_key(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.public_key())?)
    }

    pub fn public_key(&self) -> SerializedPublicKey {
        SerializedPublicKey {
            name: self.name.clone(),
            key_id: self.key_id.clone(),
            public_key: STANDARD.encode(self.public_key_bytes()),
        }
    }
}

fn key_id_for(verifying_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(verifying_key.as_bytes());
    hex::encode_upper(&digest[..KEY_ID_LEN])
}
