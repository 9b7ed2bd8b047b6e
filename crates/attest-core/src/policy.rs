//! Policy evaluation
//!
//! The `PolicyEvaluator` trait is the seam for policy engines. `RegoPolicy`
//! evaluates a Rego module with an embedded interpreter: the module's
//! `violation` set rule is queried against `{"occurrences": [...]}` and every
//! member becomes a [`Violation`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{AttestError, Result};
use crate::occurrence::Occurrence;

/// Name of the set rule every policy module must define
pub const VIOLATION_RULE: &str = "violation";

/// Document a policy is evaluated against
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInput {
    /// Every known occurrence for the resource, in canonical JSON form
    pub occurrences: Vec<Value>,
}

impl PolicyInput {
    /// Project occurrences into the evaluator schema.
    ///
    /// Each occurrence goes through its canonical serialization so policies
    /// see exactly the fields a store would hold.
    pub fn from_occurrences(occurrences: &[Occurrence]) -> Result<Self> {
        let occurrences = occurrences
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { occurrences })
    }
}

/// A single non-compliance finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    /// Raw value produced by the policy
    pub result: Value,

    /// Human-readable message
    pub message: String,

    /// Structured details, when the policy supplies them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Violation {
    /// Interpret a raw `violation` set member.
    ///
    /// Objects contribute their `msg` (or `message`) and `details` fields;
    /// bare strings become the message.
    pub fn from_result(result: Value) -> Self {
        let message = match &result {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("msg")
                .or_else(|| map.get("message"))
                .and_then(Value::as_str)
                .map(str::to_owned)
                .unwrap_or_else(|| result.to_string()),
            other => other.to_string(),
        };
        let details = result.get("details").cloned();

        Self {
            result,
            message,
            details,
        }
    }

    /// A violation standing in for a failed evaluation
    pub fn evaluation_error(policy: &str, error: impl std::fmt::Display) -> Self {
        let message = format!("error evaluating policy '{}': {}", policy, error);
        Self {
            result: Value::String(message.clone()),
            message,
            details: None,
        }
    }
}

/// A compiled policy that can be evaluated concurrently
pub trait PolicyEvaluator: Send + Sync {
    /// Policy name
    fn name(&self) -> &str;

    /// Evaluate the policy. An empty result means compliant.
    fn evaluate(&self, input: &PolicyInput) -> Vec<Violation>;
}

/// A Rego policy module
#[derive(Clone)]
pub struct RegoPolicy {
    name: String,
    source: String,
    package: String,
    trace: bool,
    engine: regorus::Engine,
}

impl std::fmt::Debug for RegoPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegoPolicy")
            .field("name", &self.name)
            .field("package", &self.package)
            .field("trace", &self.trace)
            .finish()
    }
}

impl RegoPolicy {
    /// Compile a policy module.
    ///
    /// Fails if the module does not parse, lacks a package declaration, or
    /// does not define a `violation` rule.
    pub fn new(name: impl Into<String>, source: impl Into<String>, trace: bool) -> Result<Self> {
        let name = name.into();
        let source = source.into();

        let compile_error = |message: String| AttestError::PolicyCompile {
            policy: name.clone(),
            message,
        };

        let package = package_path(&source)
            .ok_or_else(|| compile_error("missing package declaration".into()))?;
        if !declares_rule(&source, VIOLATION_RULE) {
            return Err(compile_error(format!(
                "module does not define a '{}' rule",
                VIOLATION_RULE
            )));
        }

        let mut engine = regorus::Engine::new();
        engine
            .add_policy(format!("{}.rego", name), source.clone())
            .map_err(|e| compile_error(e.to_string()))?;

        debug!(policy = %name, package = %package, "Compiled policy");

        Ok(Self {
            name,
            source,
            package,
            trace,
            engine,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    fn query(&self) -> String {
        format!("[v | v := data.{}.{}[_]]", self.package, VIOLATION_RULE)
    }

    fn try_evaluate(&self, input: &PolicyInput) -> std::result::Result<Vec<Violation>, String> {
        let input_json = serde_json::to_string(input).map_err(|e| e.to_string())?;

        // Each evaluation runs on its own copy of the compiled engine
        let mut engine = self.engine.clone();
        engine.set_input(regorus::Value::from_json_str(&input_json).map_err(|e| e.to_string())?);

        let results = engine
            .eval_query(self.query(), self.trace)
            .map_err(|e| e.to_string())?;

        let mut violations = Vec::new();
        for result in results.result {
            for expression in result.expressions {
                let value = serde_json::to_value(&expression.value).map_err(|e| e.to_string())?;
                match value {
                    Value::Array(items) => {
                        violations.extend(items.into_iter().map(Violation::from_result))
                    }
                    Value::Null => {}
                    other => violations.push(Violation::from_result(other)),
                }
            }
        }

        Ok(violations)
    }
}

impl PolicyEvaluator for RegoPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, input: &PolicyInput) -> Vec<Violation> {
        let violations = self
            .try_evaluate(input)
            .unwrap_or_else(|e| vec![Violation::evaluation_error(&self.name, e)]);

        if self.trace {
            debug!(
                policy = %self.name,
                query = %self.query(),
                occurrences = input.occurrences.len(),
                violations = ?violations.iter().map(|v| &v.message).collect::<Vec<_>>(),
                "Policy evaluation trace"
            );
        }

        violations
    }
}

/// Package path declared by a module (`package a.b` → `a.b`)
fn package_path(source: &str) -> Option<String> {
    source
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("package "))
        .map(|rest| rest.split('#').next().unwrap_or(rest).trim().to_string())
        .filter(|path| !path.is_empty())
}

/// Whether some line of the module starts a definition of `rule`
fn declares_rule(source: &str, rule: &str) -> bool {
    source.lines().map(str::trim_start).any(|line| {
        line.strip_prefix(rule)
            .and_then(|rest| rest.chars().next())
            .map_or(false, |c| !(c.is_alphanumeric() || c == '_'))
    })
}
