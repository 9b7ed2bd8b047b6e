//! Error types for enforcement and the gate service

use thiserror::Error;

use attest_core::{AttestError, StoreError};
use attest_stream::StreamError;

/// Result type alias using GateError
pub type Result<T> = std::result::Result<T, GateError>;

/// Errors raised while deciding admission or running the service
#[derive(Error, Debug)]
pub enum GateError {
    /// No attestation from `attester` verifies for the resource
    #[error("Resource '{resource}' has no valid attestation from attester '{attester}'")]
    NotAttested { resource: String, attester: String },

    /// A required attester is not registered, so nothing can verify under it
    #[error("Required attester '{0}' is not registered")]
    UnknownAttester(String),

    /// The fact store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Attestation core error
    #[error(transparent)]
    Core(#[from] AttestError),

    /// Event stream error
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// An admission review could not be decoded
    #[error("Invalid admission review: {0}")]
    Decode(String),
}

impl GateError {
    /// Whether this error is an admission decision rather than a failure
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            GateError::NotAttested { .. } | GateError::UnknownAttester(_)
        )
    }
}
