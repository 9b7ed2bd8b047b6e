//! Service configuration
//!
//! Read once at startup from `ATTEST_GATE_*` environment variables. Unset
//! variables take their defaults; malformed values are errors.

use std::time::Duration;

use tracing::Level;

use crate::error::{GateError, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ATTESTER_LABEL: &str = "attest-gate.io/attesters";
pub const DEFAULT_EXCLUDED_NAMESPACES: &str = "kube-system";
pub const DEFAULT_GRAFEAS_PROJECT: &str = "attest-gate";

/// Where the attesters required for a namespace come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A comma-separated namespace label
    Labels,
    /// Enforcer and cluster enforcer resources
    Enforcers,
}

/// Gate configuration
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub port: u16,
    pub log_level: Level,
    /// Namespaces admitted without any check
    pub excluded_namespaces: Vec<String>,
    /// Namespace label listing required attesters
    pub attester_label: String,
    pub resolution: Resolution,
    /// Grafeas base URL; the in-memory store is used when unset
    pub grafeas_url: Option<String>,
    pub grafeas_project: String,
    /// Stream name and subject prefix
    pub stream_domain: String,
    /// Longest a consumer fetch waits
    pub fetch_wait: Duration,
    /// NATS server URL; the in-memory log is used when unset
    pub nats_url: Option<String>,
    /// Subscribe to registered attesters' streams and record what arrives
    pub ingest_stream: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: Level::INFO,
            excluded_namespaces: split_list(DEFAULT_EXCLUDED_NAMESPACES),
            attester_label: DEFAULT_ATTESTER_LABEL.to_string(),
            resolution: Resolution::Labels,
            grafeas_url: None,
            grafeas_project: DEFAULT_GRAFEAS_PROJECT.to_string(),
            stream_domain: attest_stream::DEFAULT_DOMAIN.to_string(),
            fetch_wait: Duration::from_secs(1),
            nats_url: None,
            ingest_stream: false,
        }
    }
}

impl GateConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`, which maps a variable name to
    /// its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = match get("ATTEST_GATE_PORT") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| invalid("ATTEST_GATE_PORT", &v, "a port number"))?,
            None => defaults.port,
        };

        let log_level = match get("ATTEST_GATE_LOG_LEVEL") {
            Some(v) => v
                .trim()
                .parse()
                .map_err(|_| invalid("ATTEST_GATE_LOG_LEVEL", &v, "trace, debug, info, warn or error"))?,
            None => defaults.log_level,
        };

        let resolution = match get("ATTEST_GATE_RESOLUTION").as_deref().map(str::trim) {
            None | Some("labels") => Resolution::Labels,
            Some("enforcers") => Resolution::Enforcers,
            Some(other) => {
                return Err(invalid("ATTEST_GATE_RESOLUTION", other, "'labels' or 'enforcers'"))
            }
        };

        let fetch_wait = match get("ATTEST_GATE_FETCH_WAIT_MS") {
            Some(v) => match v.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => Duration::from_millis(ms),
                _ => return Err(invalid("ATTEST_GATE_FETCH_WAIT_MS", &v, "a positive integer")),
            },
            None => defaults.fetch_wait,
        };

        let ingest_stream = match get("ATTEST_GATE_INGEST_STREAM").as_deref().map(str::trim) {
            None => defaults.ingest_stream,
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            Some(other) => {
                return Err(invalid("ATTEST_GATE_INGEST_STREAM", other, "true or false"))
            }
        };

        let stream_domain = get("ATTEST_GATE_STREAM_DOMAIN").unwrap_or(defaults.stream_domain);
        if !is_subject_token(&stream_domain) {
            return Err(invalid(
                "ATTEST_GATE_STREAM_DOMAIN",
                &stream_domain,
                "a single subject token",
            ));
        }

        Ok(Self {
            port,
            log_level,
            excluded_namespaces: lookup("ATTEST_GATE_EXCLUDED_NAMESPACES")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.excluded_namespaces),
            attester_label: get("ATTEST_GATE_ATTESTER_LABEL").unwrap_or(defaults.attester_label),
            resolution,
            grafeas_url: get("ATTEST_GATE_GRAFEAS_URL"),
            grafeas_project: get("ATTEST_GATE_GRAFEAS_PROJECT").unwrap_or(defaults.grafeas_project),
            stream_domain,
            fetch_wait,
            nats_url: get("ATTEST_GATE_NATS_URL"),
            ingest_stream,
        })
    }
}

/// Split a comma-separated list, dropping blanks and duplicates
pub fn split_list(value: &str) -> Vec<String> {
    let mut items: Vec<String> = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if !items.iter().any(|existing| existing == item) {
            items.push(item.to_string());
        }
    }
    items
}

/// Whether `value` can be used as one token of a stream subject
pub fn is_subject_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn invalid(key: &str, value: &str, expected: &str) -> GateError {
    GateError::Config(format!("{}='{}' is invalid, expected {}", key, value, expected))
}
