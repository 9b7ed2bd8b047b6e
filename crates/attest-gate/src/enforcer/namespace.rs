//! Namespace metadata
//!
//! The enforcer only needs a namespace's labels. [`StaticNamespaces`] keeps
//! them in memory and is fed through the HTTP API.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

pub type Labels = BTreeMap<String, String>;

/// Source of namespace labels
#[async_trait]
pub trait NamespaceDirectory: Send + Sync + Debug {
    /// Labels of `namespace`; empty when the namespace is unknown
    async fn labels(&self, namespace: &str) -> Result<Labels>;
}

/// In-memory namespace labels
#[derive(Debug, Default)]
pub struct StaticNamespaces {
    namespaces: RwLock<HashMap<String, Labels>>,
}

impl StaticNamespaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the labels of `namespace`
    pub fn set_labels(&self, namespace: impl Into<String>, labels: Labels) {
        let namespace = namespace.into();
        info!(namespace = %namespace, labels = labels.len(), "Updated namespace labels");
        let mut namespaces = self.namespaces.write().unwrap_or_else(PoisonError::into_inner);
        namespaces.insert(namespace, labels);
    }
}

#[async_trait]
impl NamespaceDirectory for StaticNamespaces {
    async fn labels(&self, namespace: &str) -> Result<Labels> {
        let namespaces = self.namespaces.read().unwrap_or_else(PoisonError::into_inner);
        Ok(namespaces.get(namespace).cloned().unwrap_or_default())
    }
}
