//! Fact store abstraction
//!
//! Occurrences live in an external, Grafeas-compatible store. The core only
//! relies on two calls, each independently atomic: batch create, and list by
//! resource URI with read-after-write consistency.

pub mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use std::fmt::Debug;

use crate::occurrence::Occurrence;

/// Error type for fact store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Occurrence not found: {0}")]
    NotFound(String),

    #[error("Invalid occurrence: {0}")]
    InvalidOccurrence(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Storage backend for occurrences
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait OccurrenceStore: Send + Sync + Debug {
    /// Persist occurrences, returning them as stored (with names assigned)
    async fn create_occurrences(
        &self,
        occurrences: Vec<Occurrence>,
    ) -> Result<Vec<Occurrence>, StoreError>;

    /// Every occurrence recorded for `resource_uri`
    async fn list_occurrences(&self, resource_uri: &str) -> Result<Vec<Occurrence>, StoreError>;
}
