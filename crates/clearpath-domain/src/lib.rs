//! Shared vocabulary for Clearpath Audit Protocol (CAP-1.0) traces.
//!
//! Everything a trace is made of lives here: typed ids, the closed node
//! taxonomy, nodes and trust boundaries, and the canonical encoding that
//! feeds the SHA-256 hash chain. Builders and verifiers live in
//! `clearpath-trace`; this crate has no notion of mutability.

#![forbid(unsafe_code)]

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Schema version stamped on every trace and record, and required on import.
pub const SCHEMA_VERSION: &str = "CAP-1.0";

/// `previous_hash` of the first node in every trace.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Ulid::from_string(value)
                    .map(Self)
                    .map_err(|err| IdParseError {
                        kind: $label,
                        reason: err.to_string(),
                    })
            }
        }
    };
}

ulid_id!(NodeId, "node");
ulid_id!(BoundaryId, "boundary");
ulid_id!(RecordId, "record");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("invalid {kind} id: {reason}")]
pub struct IdParseError {
    kind: &'static str,
    reason: String,
}

/// Append-time rejections. A rejected operation leaves the trace untouched.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TraceError {
    #[error("invalid node type: {0}; must be one of OBSERVE, DERIVE, ASSUME, DECIDE, ACT")]
    InvalidNodeType(String),
    #[error("evidence id {0} does not reference an earlier node in this trace")]
    UnknownEvidenceReference(NodeId),
    #[error("node timestamp {current} precedes previous node timestamp {previous}")]
    NonMonotonicTimestamp {
        previous: DateTimeUtc,
        current: DateTimeUtc,
    },
    #[error("cannot {0} on a read-only trace")]
    ReadOnlyViolation(&'static str),
    #[error("boundary node {0} is not in this trace")]
    UnknownBoundaryNode(NodeId),
    #[error("node {0} already belongs to another trust boundary")]
    DuplicateBoundaryAssignment(NodeId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeType {
    Observe,
    Derive,
    Assume,
    Decide,
    Act,
}

impl NodeType {
    pub const ALL: [Self; 5] = [
        Self::Observe,
        Self::Derive,
        Self::Assume,
        Self::Decide,
        Self::Act,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observe => "OBSERVE",
            Self::Derive => "DERIVE",
            Self::Assume => "ASSUME",
            Self::Decide => "DECIDE",
            Self::Act => "ACT",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "OBSERVE" => Some(Self::Observe),
            "DERIVE" => Some(Self::Derive),
            "ASSUME" => Some(Self::Assume),
            "DECIDE" => Some(Self::Decide),
            "ACT" => Some(Self::Act),
            _ => None,
        }
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = TraceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| TraceError::InvalidNodeType(value.to_string()))
    }
}

/// One hashed step of an agent's reasoning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TraceNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub content: String,
    pub evidence: Vec<NodeId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
    pub agent_id: String,
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
    pub hash: String,
    pub previous_hash: String,
}

impl TraceNode {
    #[must_use]
    pub fn canonical_fields(&self) -> CanonicalFields<'_> {
        CanonicalFields {
            previous_hash: &self.previous_hash,
            node_type: self.node_type,
            content: &self.content,
            evidence: &self.evidence,
            timestamp: self.timestamp,
            agent_id: &self.agent_id,
            confidence: self.confidence,
            meta: self.meta.as_ref(),
        }
    }

    /// Hash recomputed from the node's stored fields, ignoring the stored `hash`.
    #[must_use]
    pub fn recompute_hash(&self) -> String {
        self.canonical_fields().digest()
    }

    /// Decision payload of a `DECIDE` node; `None` for every other type.
    #[must_use]
    pub fn decision(&self) -> Option<DecisionMeta> {
        if self.node_type != NodeType::Decide {
            return None;
        }
        self.meta.as_ref().map(DecisionMeta::from_meta)
    }
}

/// The `meta` payload carried by every `DECIDE` node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DecisionMeta {
    pub alternatives: Vec<String>,
    pub reasoning: String,
}

impl DecisionMeta {
    #[must_use]
    pub fn new(alternatives: Vec<String>, reasoning: impl Into<String>) -> Self {
        Self {
            alternatives,
            reasoning: reasoning.into(),
        }
    }

    #[must_use]
    pub fn to_meta(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert(
            "alternatives".to_string(),
            Value::Array(
                self.alternatives
                    .iter()
                    .cloned()
                    .map(Value::String)
                    .collect(),
            ),
        );
        meta.insert(
            "reasoning".to_string(),
            Value::String(self.reasoning.clone()),
        );
        meta
    }

    /// Reads back whatever decision fields are present; missing ones stay empty.
    #[must_use]
    pub fn from_meta(meta: &Map<String, Value>) -> Self {
        let alternatives = meta
            .get("alternatives")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let reasoning = meta
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self {
            alternatives,
            reasoning,
        }
    }
}

/// A named set of nodes one actor is accountable for.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrustBoundary {
    pub id: BoundaryId,
    pub name: String,
    pub description: String,
    pub nodes: Vec<NodeId>,
}

impl TrustBoundary {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, nodes: Vec<NodeId>) -> Self {
        Self {
            id: BoundaryId::new(),
            name: name.into(),
            description: description.into(),
            nodes,
        }
    }

    #[must_use]
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains(&node_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TraceHeader {
    pub agent_id: String,
    pub context: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: DateTimeUtc,
    pub schema_version: String,
}

impl TraceHeader {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, context: impl Into<String>, created_at: DateTimeUtc) -> Self {
        Self {
            agent_id: agent_id.into(),
            context: context.into(),
            created_at,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

/// The hashable fields of a node, borrowed.
///
/// Each field is written as `<byte length>:<bytes>\n`, so no field value can
/// bleed into its neighbour. Evidence ids are joined with `,` (ULID text never
/// contains one), the timestamp is the instant in Unix nanoseconds, and an
/// absent confidence or meta is the empty field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanonicalFields<'a> {
    pub previous_hash: &'a str,
    pub node_type: NodeType,
    pub content: &'a str,
    pub evidence: &'a [NodeId],
    pub timestamp: DateTimeUtc,
    pub agent_id: &'a str,
    pub confidence: Option<f64>,
    pub meta: Option<&'a Map<String, Value>>,
}

impl CanonicalFields<'_> {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let evidence = self
            .evidence
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let confidence = self
            .confidence
            .map(|value| value.to_string())
            .unwrap_or_default();
        let meta = self
            .meta
            .map(|map| canonicalize_json(&Value::Object(map.clone())).to_string())
            .unwrap_or_default();

        let mut out = Vec::new();
        push_field(&mut out, self.previous_hash.as_bytes());
        push_field(&mut out, self.node_type.as_str().as_bytes());
        push_field(&mut out, self.content.as_bytes());
        push_field(&mut out, evidence.as_bytes());
        push_field(
            &mut out,
            self.timestamp.unix_timestamp_nanos().to_string().as_bytes(),
        );
        push_field(&mut out, self.agent_id.as_bytes());
        push_field(&mut out, confidence.as_bytes());
        push_field(&mut out, meta.as_bytes());
        out
    }

    #[must_use]
    pub fn digest(&self) -> String {
        hash_bytes(&self.encode())
    }
}

fn push_field(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
    out.push(b'\n');
}

/// Rebuilds `value` with object keys sorted at every depth. Array order is kept.
#[must_use]
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            let mut sorted = Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), canonicalize_json(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns an error when the value cannot be represented in RFC3339.
pub fn format_rfc3339(value: DateTimeUtc) -> Result<String, time::error::Format> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns an error when `value` is not valid RFC3339.
pub fn parse_rfc3339_utc(value: &str) -> Result<DateTimeUtc, time::error::Parse> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
}
