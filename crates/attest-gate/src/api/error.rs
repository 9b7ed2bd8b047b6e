//! API error types and responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use attest_core::{AttestError, StoreError, ViolationError};
use attest_stream::StreamError;

use crate::error::GateError;

/// API error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Admission denied")]
    Denied(String),

    #[error("Policy violation")]
    Violation(ViolationError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// API error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match &self {
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                None,
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                None,
            ),
            ApiError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                msg.clone(),
                None,
            ),
            ApiError::InvalidPolicy(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "INVALID_POLICY",
                msg.clone(),
                None,
            ),
            ApiError::Denied(msg) => (
                StatusCode::FORBIDDEN,
                "DENIED",
                msg.clone(),
                None,
            ),
            ApiError::Violation(err) => (
                StatusCode::FORBIDDEN,
                "POLICY_VIOLATION",
                err.to_string(),
                Some(serde_json::json!({
                    "attester": err.attester,
                    "violations": err.violations,
                })),
            ),
            ApiError::Unavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "UNAVAILABLE",
                msg.clone(),
                None,
            ),
        };

        let body = ErrorResponse {
            error: message,
            code: code.to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::NotFound(msg),
            StoreError::InvalidOccurrence(msg) => ApiError::BadRequest(msg),
            StoreError::Connection(msg) => ApiError::Unavailable(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AttestError> for ApiError {
    fn from(err: AttestError) -> Self {
        match err {
            AttestError::PolicyCompile { .. } => ApiError::InvalidPolicy(err.to_string()),
            AttestError::Violation(violation) => ApiError::Violation(violation),
            AttestError::Store(store) => store.into(),
            AttestError::KeyMaterial(_) | AttestError::InvalidOccurrence(_) => {
                ApiError::BadRequest(err.to_string())
            }
            AttestError::Publish(msg) => ApiError::Unavailable(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<StreamError> for ApiError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Core(core) => core.into(),
            other => ApiError::Unavailable(other.to_string()),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        if err.is_denial() {
            return ApiError::Denied(err.to_string());
        }
        match err {
            GateError::Store(store) => store.into(),
            GateError::Core(core) => core.into(),
            GateError::Stream(stream) => stream.into(),
            GateError::Decode(msg) => ApiError::BadRequest(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<base64::DecodeError> for ApiError {
    fn from(err: base64::DecodeError) -> Self {
        ApiError::BadRequest(format!("Invalid base64 encoding: {}", err))
    }
}
