//! Attester registry
//!
//! Thread-safe collection of attesters keyed by name. Reconciliation paths
//! add and remove attesters while orchestration and enforcement read them, so
//! reads never block each other.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;

use crate::attester::Attester;

/// Registry of named attesters
#[derive(Debug, Default)]
pub struct AttesterRegistry {
    attesters: RwLock<BTreeMap<String, Arc<Attester>>>,
}

impl AttesterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an attester, replacing any attester with the same name.
    ///
    /// Returns the replaced attester, if any.
    pub fn add(&self, attester: Arc<Attester>) -> Option<Arc<Attester>> {
        let mut attesters = self.attesters.write().unwrap_or_else(PoisonError::into_inner);
        let name = attester.name().to_string();
        let replaced = attesters.insert(name.clone(), attester);
        if replaced.is_some() {
            info!(attester = %name, "Replaced attester");
        } else {
            info!(attester = %name, "Registered attester");
        }
        replaced
    }

    /// Remove an attester by name
    pub fn remove(&self, name: &str) -> Option<Arc<Attester>> {
        let mut attesters = self.attesters.write().unwrap_or_else(PoisonError::into_inner);
        let removed = attesters.remove(name);
        if removed.is_some() {
            info!(attester = %name, "Removed attester");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<Attester>> {
        let attesters = self.attesters.read().unwrap_or_else(PoisonError::into_inner);
        attesters.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        let attesters = self.attesters.read().unwrap_or_else(PoisonError::into_inner);
        attesters.contains_key(name)
    }

    /// Snapshot of every attester, ordered by name
    pub fn get_all(&self) -> BTreeMap<String, Arc<Attester>> {
        let attesters = self.attesters.read().unwrap_or_else(PoisonError::into_inner);
        attesters.clone()
    }

    /// Every attester whose signer has key ID `key_id`
    ///
    /// Several attesters may share one signer, so the result is itself a
    /// registry that can be iterated to verify an attestation whose producer
    /// is not known in advance.
    pub fn find_by_key_id(&self, key_id: &str) -> AttesterRegistry {
        let attesters = self.attesters.read().unwrap_or_else(PoisonError::into_inner);
        let matching = attesters
            .iter()
            .filter(|(_, attester)| attester.signer().key_id() == key_id)
            .map(|(name, attester)| (name.clone(), attester.clone()))
            .collect();

        AttesterRegistry {
            attesters: RwLock::new(matching),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let attesters = self.attesters.read().unwrap_or_else(PoisonError::into_inner);
        attesters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let attesters = self.attesters.read().unwrap_or_else(PoisonError::into_inner);
        attesters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
