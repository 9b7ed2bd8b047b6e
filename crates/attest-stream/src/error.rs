//! Error types for the attestation event stream

use thiserror::Error;

use attest_core::AttestError;

/// Result type alias using StreamError
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised by the durable log and the event manager
#[derive(Error, Debug)]
pub enum StreamError {
    /// The durable log backend failed
    #[error("Durable log error: {0}")]
    Log(String),

    /// No stream exists with the given name, or none captures a subject
    #[error("No stream for '{0}'")]
    NoStream(String),

    /// The durable consumer does not exist or is not attached
    #[error("Consumer '{durable}' not found on stream '{stream}'")]
    ConsumerNotFound { stream: String, durable: String },

    /// A message body could not be turned back into an occurrence
    #[error("Failed to decode message on '{subject}': {message}")]
    Decode { subject: String, message: String },

    /// Attestation core error
    #[error(transparent)]
    Core(#[from] AttestError),
}

impl From<StreamError> for AttestError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Core(inner) => inner,
            other => AttestError::Publish(other.to_string()),
        }
    }
}
