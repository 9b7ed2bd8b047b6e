//! In-memory storage backend
//!
//! Default store for development and single-instance deployments.
//! Data is lost on restart.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

use super::{OccurrenceStore, StoreError};
use crate::occurrence::{Occurrence, NOTE_PROJECT};

/// In-memory occurrence store
#[derive(Debug)]
pub struct MemoryStore {
    project: String,
    occurrences: RwLock<HashMap<String, Vec<Occurrence>>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_project(NOTE_PROJECT)
    }

    /// Create a store that names occurrences under `project`
    pub fn with_project(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            occurrences: RwLock::new(HashMap::new()),
        }
    }

    /// Total number of stored occurrences
    pub fn len(&self) -> usize {
        let occurrences = self.occurrences.read().unwrap_or_else(PoisonError::into_inner);
        occurrences.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OccurrenceStore for MemoryStore {
    async fn create_occurrences(
        &self,
        occurrences: Vec<Occurrence>,
    ) -> Result<Vec<Occurrence>, StoreError> {
        if let Some(bad) = occurrences.iter().find(|o| o.resource.uri.is_empty()) {
            return Err(StoreError::InvalidOccurrence(format!(
                "occurrence of note '{}' has no resource URI",
                bad.note_name
            )));
        }

        let now = Utc::now();
        let created: Vec<Occurrence> = occurrences
            .into_iter()
            .map(|mut occurrence| {
                if occurrence.name.is_empty() {
                    occurrence.name = format!(
                        "projects/{}/occurrences/{}",
                        self.project,
                        uuid::Uuid::new_v4()
                    );
                }
                occurrence.create_time.get_or_insert(now);
                occurrence
            })
            .collect();

        let mut stored = self.occurrences.write().unwrap_or_else(PoisonError::into_inner);
        for occurrence in &created {
            let existing = stored.entry(occurrence.resource.uri.clone()).or_default();
            // Redelivered occurrences keep their name and are stored once
            if existing.iter().any(|o| o.name == occurrence.name) {
                debug!(name = %occurrence.name, "Occurrence already stored");
                continue;
            }
            existing.push(occurrence.clone());
        }

        debug!(count = created.len(), "Stored occurrences");
        Ok(created)
    }

    async fn list_occurrences(&self, resource_uri: &str) -> Result<Vec<Occurrence>, StoreError> {
        let stored = self.occurrences.read().unwrap_or_else(PoisonError::into_inner);
        Ok(stored.get(resource_uri).cloned().unwrap_or_default())
    }
}
