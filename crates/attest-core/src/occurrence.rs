//! Occurrences: immutable facts recorded about a resource
//!
//! The JSON shape follows the Grafeas v1beta1 occurrence resource so that
//! occurrences round-trip through a Grafeas-compatible store unchanged.
//! Fields the model does not name are kept in `extra` maps and written back
//! as they were read, so policies see every field the store holds.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::encoding::base64_bytes;

/// Project under which attestation notes are named
pub const NOTE_PROJECT: &str = "attest-gate";

/// Note name for attestations produced by the named attester
pub fn attester_note_name(attester: &str) -> String {
    format!("projects/{}/notes/{}", NOTE_PROJECT, attester)
}

/// Unmodelled JSON fields of a Grafeas object
pub type Extra = Map<String, Value>;

/// An immutable fact about a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    /// Store-assigned name; empty until persisted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    /// Resource the fact is about
    pub resource: Resource,

    /// Note (type) this occurrence is an instance of
    #[serde(default)]
    pub note_name: String,

    /// Kind of fact
    #[serde(default)]
    pub kind: NoteKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered: Option<DiscoveredDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vulnerability: Option<VulnerabilityDetails>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<AttestationDetails>,

    /// Store-assigned creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<DateTime<Utc>>,

    /// Other details such as `build`, `remediation` or `updateTime`
    #[serde(flatten)]
    pub extra: Extra,
}

/// The resource an occurrence refers to, identified by URI (image reference)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,

    #[serde(flatten)]
    pub extra: Extra,
}

impl Resource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            extra: Extra::new(),
        }
    }
}

/// Kind of an occurrence's note
///
/// Kinds without a dedicated variant keep their wire name in `Other`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NoteKind {
    #[default]
    NoteKindUnspecified,
    Discovery,
    Vulnerability,
    Attestation,
    Other(String),
}

impl NoteKind {
    pub fn as_str(&self) -> &str {
        match self {
            NoteKind::NoteKindUnspecified => "NOTE_KIND_UNSPECIFIED",
            NoteKind::Discovery => "DISCOVERY",
            NoteKind::Vulnerability => "VULNERABILITY",
            NoteKind::Attestation => "ATTESTATION",
            NoteKind::Other(kind) => kind,
        }
    }
}

impl From<String> for NoteKind {
    fn from(kind: String) -> Self {
        match kind.as_str() {
            "NOTE_KIND_UNSPECIFIED" => NoteKind::NoteKindUnspecified,
            "DISCOVERY" => NoteKind::Discovery,
            "VULNERABILITY" => NoteKind::Vulnerability,
            "ATTESTATION" => NoteKind::Attestation,
            _ => NoteKind::Other(kind),
        }
    }
}

impl From<NoteKind> for String {
    fn from(kind: NoteKind) -> Self {
        match kind {
            NoteKind::Other(kind) => kind,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for NoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDetails {
    pub discovered: Discovered,

    #[serde(flatten)]
    pub extra: Extra,
}

/// Outcome of an image scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discovered {
    #[serde(default)]
    pub analysis_status: AnalysisStatus,

    /// Other fields such as `analysisStatusError` or `continuousAnalysis`
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStatus {
    #[default]
    AnalysisStatusUnspecified,
    Pending,
    Scanning,
    FinishedSuccess,
    FinishedFailed,
    FinishedUnsupported,
}

/// A single vulnerability found in a resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityDetails {
    #[serde(default)]
    pub severity: Severity,

    #[serde(default)]
    pub cvss_score: f64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_description: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub package_issue: Vec<PackageIssue>,

    /// Other fields such as `effectiveSeverity`, `type` or `relatedUrls`
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    #[default]
    SeverityUnspecified,
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

/// Where a vulnerability was found and where it is fixed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageIssue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected_location: Option<VulnerabilityLocation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_location: Option<VulnerabilityLocation>,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A package version within a CPE-identified distribution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VulnerabilityLocation {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cpe_uri: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub package: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<PackageVersion>,

    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<i32>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,

    /// `NORMAL`, `MINIMUM` or `MAXIMUM`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(flatten)]
    pub extra: Extra,
}

impl VulnerabilityLocation {
    /// A location for `package` at `version` (a plain version name)
    pub fn new(package: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            version: Some(PackageVersion {
                name: version.into(),
                kind: Some("NORMAL".into()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDetails {
    pub attestation: Attestation,

    #[serde(flatten)]
    pub extra: Extra,
}

/// A signed attestation; only the generic signing form is produced or verified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generic_signed_attestation: Option<GenericSignedAttestation>,

    /// Other forms such as `pgpSignedAttestation`
    #[serde(flatten)]
    pub extra: Extra,
}

/// Signed claim over a serialized payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenericSignedAttestation {
    #[serde(default)]
    pub content_type: ContentType,

    /// The claim that was signed: the attested resource URI
    #[serde(with = "base64_bytes")]
    pub serialized_payload: Vec<u8>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentType {
    #[default]
    ContentTypeUnspecified,
    SimpleSigningJson,
}

/// A signature and the ID of the key that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub public_key_id: String,
}

impl Occurrence {
    fn new(resource_uri: impl Into<String>, note_name: impl Into<String>, kind: NoteKind) -> Self {
        Self {
            name: String::new(),
            resource: Resource::new(resource_uri),
            note_name: note_name.into(),
            kind,
            discovered: None,
            vulnerability: None,
            attestation: None,
            create_time: None,
            extra: Extra::new(),
        }
    }

    /// A scan-status fact
    pub fn discovery(
        resource_uri: impl Into<String>,
        note_name: impl Into<String>,
        status: AnalysisStatus,
    ) -> Self {
        let mut occurrence = Self::new(resource_uri, note_name, NoteKind::Discovery);
        occurrence.discovered = Some(DiscoveredDetails {
            discovered: Discovered {
                analysis_status: status,
                extra: Extra::new(),
            },
            extra: Extra::new(),
        });
        occurrence
    }

    /// A single vulnerability fact
    pub fn vulnerability(
        resource_uri: impl Into<String>,
        note_name: impl Into<String>,
        details: VulnerabilityDetails,
    ) -> Self {
        let mut occurrence = Self::new(resource_uri, note_name, NoteKind::Vulnerability);
        occurrence.vulnerability = Some(details);
        occurrence
    }

    /// An attestation fact carrying `signature` over the resource URI
    pub fn attestation(
        resource_uri: impl Into<String>,
        note_name: impl Into<String>,
        signature: Vec<u8>,
        key_id: impl Into<String>,
    ) -> Self {
        let resource_uri = resource_uri.into();
        let payload = resource_uri.as_bytes().to_vec();
        let mut occurrence = Self::new(resource_uri, note_name, NoteKind::Attestation);
        occurrence.attestation = Some(AttestationDetails {
            attestation: Attestation {
                generic_signed_attestation: Some(GenericSignedAttestation {
                    content_type: ContentType::ContentTypeUnspecified,
                    serialized_payload: payload,
                    signatures: vec![Signature {
                        signature,
                        public_key_id: key_id.into(),
                    }],
                }),
                extra: Extra::new(),
            },
            extra: Extra::new(),
        });
        occurrence
    }

    /// URI of the resource this occurrence is about
    pub fn resource_uri(&self) -> &str {
        &self.resource.uri
    }

    /// Whether this is a generically signed attestation
    pub fn is_attestation(&self) -> bool {
        self.kind == NoteKind::Attestation && self.generic_attestation().is_some()
    }

    /// Generic signed form of an attestation occurrence
    pub fn generic_attestation(&self) -> Option<&GenericSignedAttestation> {
        if self.kind != NoteKind::Attestation {
            return None;
        }
        self.attestation
            .as_ref()
            .and_then(|a| a.attestation.generic_signed_attestation.as_ref())
    }

    pub(crate) fn generic_attestation_mut(&mut self) -> Option<&mut GenericSignedAttestation> {
        if self.kind != NoteKind::Attestation {
            return None;
        }
        self.attestation
            .as_mut()
            .and_then(|a| a.attestation.generic_signed_attestation.as_mut())
    }

    /// First signature of an attestation occurrence
    pub fn attestation_signature(&self) -> Option<&Signature> {
        self.generic_attestation()
            .and_then(|generic| generic.signatures.first())
    }

    /// Analysis status of a discovery occurrence
    pub fn analysis_status(&self) -> Option<AnalysisStatus> {
        self.discovered
            .as_ref()
            .map(|d| d.discovered.analysis_status)
    }

    /// Canonical serialized form
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}
