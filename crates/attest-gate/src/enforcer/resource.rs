//! Enforcer resources
//!
//! An enforcer resource names the attesters whose attestations are required
//! for admission. Namespaced enforcers apply to their own namespace; cluster
//! enforcers apply to a namespace list under an Include or Exclude strategy.
//! Both are held behind the [`EnforcerResource`] trait and built from an
//! [`EnforcerSpec`] by [`enforcer_resource`], which picks the variant by
//! whether `namespace` is set.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ATTESTERS_RESOLVED: &str = "AttestersResolved";

/// How a cluster enforcer's namespace list is interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// Apply only to the listed namespaces
    #[default]
    Include,
    /// Apply to every namespace except the listed ones
    Exclude,
}

/// Declarative enforcer definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcerSpec {
    pub name: String,
    /// Set for namespaced enforcers, absent for cluster enforcers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Attesters whose attestations are required
    pub attesters: Vec<String>,
    #[serde(default)]
    pub strategy: MatchStrategy,
    /// Namespaces the strategy applies to (cluster enforcers only)
    #[serde(default)]
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Namespaced(String),
    Cluster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Observed state of an enforcer resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}

/// Capability shared by namespaced and cluster enforcers
pub trait EnforcerResource: Send + Sync + Debug {
    fn spec(&self) -> &EnforcerSpec;

    fn scope(&self) -> Scope;

    /// Whether this resource governs `namespace`
    fn applies_to(&self, namespace: &str) -> bool;

    fn name(&self) -> &str {
        &self.spec().name
    }

    fn required_attesters(&self) -> &[String] {
        &self.spec().attesters
    }

    fn conditions(&self) -> Vec<Condition>;

    /// Record `condition`, replacing any condition of the same type.
    ///
    /// The transition time is kept when the status does not change.
    fn set_condition(&self, condition: Condition);
}

#[derive(Debug, Default)]
struct Conditions(RwLock<Vec<Condition>>);

impl Conditions {
    fn snapshot(&self) -> Vec<Condition> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set(&self, mut condition: Condition) {
        let mut conditions = self.0.write().unwrap_or_else(PoisonError::into_inner);
        match conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => conditions.push(condition),
        }
    }
}

/// Enforcer bound to a single namespace
#[derive(Debug)]
pub struct NamespacedEnforcer {
    spec: EnforcerSpec,
    namespace: String,
    conditions: Conditions,
}

impl EnforcerResource for NamespacedEnforcer {
    fn spec(&self) -> &EnforcerSpec {
        &self.spec
    }

    fn scope(&self) -> Scope {
        Scope::Namespaced(self.namespace.clone())
    }

    fn applies_to(&self, namespace: &str) -> bool {
        self.namespace == namespace
    }

    fn conditions(&self) -> Vec<Condition> {
        self.conditions.snapshot()
    }

    fn set_condition(&self, condition: Condition) {
        self.conditions.set(condition)
    }
}

/// Enforcer applying across namespaces
#[derive(Debug)]
pub struct ClusterEnforcer {
    spec: EnforcerSpec,
    conditions: Conditions,
}

impl EnforcerResource for ClusterEnforcer {
    fn spec(&self) -> &EnforcerSpec {
        &self.spec
    }

    fn scope(&self) -> Scope {
        Scope::Cluster
    }

    fn applies_to(&self, namespace: &str) -> bool {
        let listed = self.spec.namespaces.iter().any(|n| n == namespace);
        match self.spec.strategy {
            MatchStrategy::Include => listed,
            MatchStrategy::Exclude => !listed,
        }
    }

    fn conditions(&self) -> Vec<Condition> {
        self.conditions.snapshot()
    }

    fn set_condition(&self, condition: Condition) {
        self.conditions.set(condition)
    }
}

/// Namespaced when `spec.namespace` is set, cluster-scoped otherwise
pub fn enforcer_resource(spec: EnforcerSpec) -> Arc<dyn EnforcerResource> {
    match spec.namespace.clone() {
        Some(namespace) => Arc::new(NamespacedEnforcer {
            spec,
            namespace,
            conditions: Conditions::default(),
        }),
        None => Arc::new(ClusterEnforcer {
            spec,
            conditions: Conditions::default(),
        }),
    }
}

fn key(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(namespace) => format!("{}/{}", namespace, name),
        None => name.to_string(),
    }
}

/// Registered enforcer resources
#[derive(Debug, Default)]
pub struct EnforcerDirectory {
    resources: RwLock<BTreeMap<String, Arc<dyn EnforcerResource>>>,
}

impl EnforcerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the resource described by `spec`
    pub fn apply(&self, spec: EnforcerSpec) -> Arc<dyn EnforcerResource> {
        let key = key(spec.namespace.as_deref(), &spec.name);
        let resource = enforcer_resource(spec);
        info!(enforcer = %key, scope = ?resource.scope(), "Applied enforcer");

        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        resources.insert(key, resource.clone());
        resource
    }

    pub fn remove(&self, namespace: Option<&str>, name: &str) -> Option<Arc<dyn EnforcerResource>> {
        let key = key(namespace, name);
        let mut resources = self.resources.write().unwrap_or_else(PoisonError::into_inner);
        let removed = resources.remove(&key);
        if removed.is_some() {
            info!(enforcer = %key, "Removed enforcer");
        }
        removed
    }

    pub fn list(&self) -> Vec<Arc<dyn EnforcerResource>> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        resources.values().cloned().collect()
    }

    /// Resources governing `namespace`
    pub fn applicable(&self, namespace: &str) -> Vec<Arc<dyn EnforcerResource>> {
        let resources = self.resources.read().unwrap_or_else(PoisonError::into_inner);
        resources
            .values()
            .filter(|r| r.applies_to(namespace))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.resources.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, namespace: Option<&str>) -> EnforcerSpec {
        EnforcerSpec {
            name: name.into(),
            namespace: namespace.map(String::from),
            attesters: vec!["harbor".into()],
            strategy: MatchStrategy::Include,
            namespaces: vec![],
        }
    }

    #[test]
    fn test_factory_picks_scope() {
        let namespaced = enforcer_resource(spec("e", Some("prod")));
        assert_eq!(namespaced.scope(), Scope::Namespaced("prod".into()));
        assert!(namespaced.applies_to("prod"));
        assert!(!namespaced.applies_to("dev"));

        let cluster = enforcer_resource(spec("e", None));
        assert_eq!(cluster.scope(), Scope::Cluster);
    }

    #[test]
    fn test_cluster_strategies() {
        let mut include = spec("include", None);
        include.namespaces = vec!["prod".into(), "staging".into()];
        let include = enforcer_resource(include);
        assert!(include.applies_to("prod"));
        assert!(!include.applies_to("dev"));

        let mut exclude = spec("exclude", None);
        exclude.strategy = MatchStrategy::Exclude;
        exclude.namespaces = vec!["dev".into()];
        let exclude = enforcer_resource(exclude);
        assert!(exclude.applies_to("prod"));
        assert!(!exclude.applies_to("dev"));
    }

    #[test]
    fn test_spec_json_defaults() {
        let spec: EnforcerSpec =
            serde_json::from_str(r#"{"name": "all", "attesters": ["harbor"]}"#).unwrap();
        assert_eq!(spec.strategy, MatchStrategy::Include);
        assert!(spec.namespace.is_none());

        let spec: EnforcerSpec = serde_json::from_str(
            r#"{"name": "most", "attesters": [], "strategy": "Exclude", "namespaces": ["dev"]}"#,
        )
        .unwrap();
        assert_eq!(spec.strategy, MatchStrategy::Exclude);
    }

    #[test]
    fn test_condition_transition_time_kept_while_status_unchanged() {
        let resource = enforcer_resource(spec("e", Some("prod")));
        resource.set_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Applied",
            "",
        ));
        let first = resource.conditions()[0].last_transition_time;

        std::thread::sleep(std::time::Duration::from_millis(5));
        resource.set_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::True,
            "Applied",
            "still ready",
        ));
        let conditions = resource.conditions();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, first);
        assert_eq!(conditions[0].message, "still ready");

        resource.set_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "Broken",
            "",
        ));
        assert!(resource.conditions()[0].last_transition_time > first);
    }

    #[test]
    fn test_directory_keys_by_scope() {
        let directory = EnforcerDirectory::new();
        directory.apply(spec("e", Some("prod")));
        directory.apply(spec("e", Some("dev")));
        directory.apply(spec("e", None));
        assert_eq!(directory.len(), 3);

        assert_eq!(directory.applicable("prod").len(), 1);
        assert!(directory.remove(Some("prod"), "e").is_some());
        assert!(directory.applicable("prod").is_empty());
        assert!(directory.remove(None, "missing").is_none());
    }
}
