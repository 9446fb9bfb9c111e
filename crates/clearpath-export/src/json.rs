use clearpath_domain::{
    parse_rfc3339_utc, DateTimeUtc, TraceHeader, TraceNode, TrustBoundary, SCHEMA_VERSION,
};
use clearpath_trace::{DecisionRecord, SealedTrace, Trace, TraceSource};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid json: expected object")]
    NotAnObject,
    #[error("invalid schema_version: expected \"CAP-1.0\", got {found}")]
    SchemaVersion { found: String },
    #[error("missing or invalid {0} array")]
    MissingArray(&'static str),
    #[error("missing or invalid {0}")]
    MissingText(&'static str),
    #[error("created_at is not an RFC 3339 timestamp: {0}")]
    CreatedAt(#[source] time::error::Parse),
    #[error("node at index {index} missing hash")]
    MissingHash { index: usize },
    #[error("node at index {index} is malformed: {source}")]
    MalformedNode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("trust boundary at index {index} is malformed: {source}")]
    MalformedBoundary {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("node at index {index} has a non-finite confidence")]
    NonFiniteConfidence { index: usize },
    #[error("nodes must be ordered by timestamp (node at index {index} precedes its predecessor)")]
    TimestampOrder { index: usize },
}

#[derive(Serialize)]
struct ExportPayload<'a> {
    schema_version: &'a str,
    agent_id: &'a str,
    context: &'a str,
    #[serde(with = "time::serde::rfc3339")]
    created_at: DateTimeUtc,
    nodes: &'a [TraceNode],
    trust_boundaries: &'a [TrustBoundary],
}

impl<'a> ExportPayload<'a> {
    fn from_source<S: TraceSource + ?Sized>(source: &'a S) -> Self {
        let header = source.header();
        Self {
            schema_version: &header.schema_version,
            agent_id: &header.agent_id,
            context: &header.context,
            created_at: header.created_at,
            nodes: source.nodes(),
            trust_boundaries: source.boundaries(),
        }
    }
}

/// Compact JSON with a fixed field order, suitable for archiving and diffing.
///
/// # Errors
/// Returns [`ExportError::NonFiniteConfidence`] for a NaN or infinite
/// confidence, which JSON cannot carry, and [`ExportError::Json`] when a
/// timestamp cannot be written as RFC 3339.
pub fn export_json<S: TraceSource + ?Sized>(source: &S) -> Result<String, ExportError> {
    check_confidences(source.nodes())?;
    Ok(serde_json::to_string(&ExportPayload::from_source(source))?)
}

/// # Errors
/// See [`export_json`].
pub fn export_json_pretty<S: TraceSource + ?Sized>(source: &S) -> Result<String, ExportError> {
    check_confidences(source.nodes())?;
    Ok(serde_json::to_string_pretty(&ExportPayload::from_source(
        source,
    ))?)
}

/// # Errors
/// See [`export_json`].
pub fn export_record_json(record: &DecisionRecord) -> Result<String, ExportError> {
    check_confidences(record.trace())?;
    Ok(serde_json::to_string(record)?)
}

// serde_json writes NaN and infinity as null, which would not hash the same
// on import.
fn check_confidences(nodes: &[TraceNode]) -> Result<(), ExportError> {
    match nodes
        .iter()
        .position(|node| node.confidence.is_some_and(|value| !value.is_finite()))
    {
        Some(index) => Err(ExportError::NonFiniteConfidence { index }),
        None => Ok(()),
    }
}

/// Rebuilds a read-only trace from [`export_json`] output.
///
/// Stored hashes are kept as they are, so a tampered export still imports;
/// verification is what reports it.
///
/// # Errors
/// Returns the first structural problem found, checking in order: JSON
/// syntax, top-level object, `schema_version`, the `nodes` and
/// `trust_boundaries` arrays, the `agent_id`, `context` and `created_at`
/// text fields, a `hash` on every node, the shape of each node and boundary,
/// and finally non-decreasing node timestamps.
pub fn import_json(json: &str) -> Result<Trace, ExportError> {
    let value = serde_json::from_str::<Value>(json)?;
    let Value::Object(object) = value else {
        return Err(ExportError::NotAnObject);
    };

    match object.get("schema_version") {
        Some(Value::String(version)) if version == SCHEMA_VERSION => {}
        Some(Value::String(version)) => {
            return Err(ExportError::SchemaVersion {
                found: version.clone(),
            })
        }
        Some(other) => {
            return Err(ExportError::SchemaVersion {
                found: other.to_string(),
            })
        }
        None => {
            return Err(ExportError::SchemaVersion {
                found: "nothing".to_string(),
            })
        }
    }

    let raw_nodes = array_field(&object, "nodes")?;
    let raw_boundaries = array_field(&object, "trust_boundaries")?;
    let agent_id = text_field(&object, "agent_id")?;
    let context = text_field(&object, "context")?;
    let created_at =
        parse_rfc3339_utc(text_field(&object, "created_at")?).map_err(ExportError::CreatedAt)?;

    if let Some(index) = raw_nodes
        .iter()
        .position(|node| !node.get("hash").is_some_and(Value::is_string))
    {
        return Err(ExportError::MissingHash { index });
    }

    let nodes = raw_nodes
        .iter()
        .enumerate()
        .map(|(index, node)| {
            TraceNode::deserialize(node)
                .map_err(|source| ExportError::MalformedNode { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let boundaries = raw_boundaries
        .iter()
        .enumerate()
        .map(|(index, boundary)| {
            TrustBoundary::deserialize(boundary)
                .map_err(|source| ExportError::MalformedBoundary { index, source })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(index) = nodes
        .windows(2)
        .position(|pair| pair[1].timestamp < pair[0].timestamp)
    {
        return Err(ExportError::TimestampOrder { index: index + 1 });
    }

    tracing::debug!(
        nodes = nodes.len(),
        boundaries = boundaries.len(),
        "imported read-only trace"
    );
    let header = TraceHeader::new(agent_id, context, created_at);
    Ok(Trace::ReadOnly(SealedTrace::from_parts(
        header, nodes, boundaries,
    )))
}

fn array_field<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a [Value], ExportError> {
    object
        .get(field)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .ok_or(ExportError::MissingArray(field))
}

fn text_field<'a>(
    object: &'a Map<String, Value>,
    field: &'static str,
) -> Result<&'a str, ExportError> {
    object
        .get(field)
        .and_then(Value::as_str)
        .ok_or(ExportError::MissingText(field))
}

#[cfg(test)]
mod tests {
    use clearpath_domain::{DecisionMeta, NodeType, TraceError};
    use clearpath_trace::{assemble_record, TraceBuilder};
    use serde_json::json;

    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
        match result {
            Ok(value) => panic!("expected Err(..), got Ok({value:?})"),
            Err(err) => err,
        }
    }

    fn purchase_trace() -> TraceBuilder {
        let mut builder = TraceBuilder::new("agent-1", "Purchase approval");
        let request = must_ok(builder.observe("Request received", None));
        let budget = must_ok(builder.observe("Budget checked", Some(0.95)));
        let within = must_ok(builder.derive("Within budget", &[request.id, budget.id], None));
        let decision = DecisionMeta::new(vec!["Reject".to_string()], "Within policy");
        let approve = must_ok(builder.decide("Approve", &decision, &[within.id], Some(0.8)));
        must_ok(builder.set_boundary("human", &[request.id], Some("requester")));
        must_ok(builder.set_boundary("agent", &[budget.id, within.id, approve.id], None));
        builder
    }

    fn exported_value(builder: &TraceBuilder) -> Value {
        must_ok(serde_json::from_str(&must_ok(export_json(builder))))
    }

    fn import_value(value: &Value) -> Result<Trace, ExportError> {
        import_json(&value.to_string())
    }

    #[test]
    fn round_trip_preserves_the_trace_and_verifies() {
        let builder = purchase_trace();
        let imported = must_ok(import_json(&must_ok(export_json(&builder))));

        assert!(imported.is_read_only());
        assert!(imported.verify().valid);
        assert_eq!(imported.nodes(), builder.nodes());
        assert_eq!(imported.boundaries(), builder.boundaries());
        assert_eq!(imported.header(), builder.header());
    }

    #[test]
    fn pretty_and_compact_exports_describe_the_same_trace() {
        let builder = purchase_trace();
        let compact = must_ok(import_json(&must_ok(export_json(&builder))));
        let pretty = must_ok(import_json(&must_ok(export_json_pretty(&builder))));
        assert_eq!(compact.nodes(), pretty.nodes());
        assert_eq!(compact.header(), pretty.header());
    }

    #[test]
    fn export_is_deterministic_with_fixed_field_order() {
        let builder = purchase_trace();
        let first = must_ok(export_json(&builder));
        let second = must_ok(export_json(&builder));
        assert_eq!(first, second);
        assert!(first.starts_with(r#"{"schema_version":"CAP-1.0","agent_id":"agent-1","context":"Purchase approval","created_at":"#));
        assert!(!first.contains('\n'));
    }

    #[test]
    fn tampered_export_imports_but_fails_verification() {
        let builder = purchase_trace();
        let mut value = exported_value(&builder);
        value["nodes"][2]["content"] = json!("Over budget");

        let imported = must_ok(import_value(&value));
        let result = imported.verify();
        assert!(!result.valid);
        assert_eq!(result.broken_at, Some(builder.nodes()[2].id));
    }

    #[test]
    fn wrong_or_missing_schema_version_is_rejected() {
        let mut value = exported_value(&purchase_trace());
        value["schema_version"] = json!("CAP-0.9");
        let err = must_err(import_value(&value));
        assert!(matches!(err, ExportError::SchemaVersion { ref found } if found == "CAP-0.9"));
        assert!(err.to_string().contains("CAP-1.0"));

        if let Some(object) = value.as_object_mut() {
            object.remove("schema_version");
        }
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::SchemaVersion { .. }
        ));
    }

    #[test]
    fn non_object_and_invalid_json_are_rejected() {
        assert!(matches!(must_err(import_json("[1, 2]")), ExportError::NotAnObject));
        assert!(matches!(must_err(import_json("{nope")), ExportError::Json(_)));
    }

    #[test]
    fn arrays_and_header_text_are_required() {
        let original = exported_value(&purchase_trace());

        let mut value = original.clone();
        value["nodes"] = json!({});
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::MissingArray("nodes")
        ));

        let mut value = original.clone();
        value["trust_boundaries"] = Value::Null;
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::MissingArray("trust_boundaries")
        ));

        let mut value = original.clone();
        value["context"] = json!(7);
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::MissingText("context")
        ));

        let mut value = original;
        value["created_at"] = json!("yesterday");
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::CreatedAt(_)
        ));
    }

    #[test]
    fn node_without_hash_is_rejected_by_index() {
        let mut value = exported_value(&purchase_trace());
        if let Some(node) = value["nodes"][1].as_object_mut() {
            node.remove("hash");
        }
        let err = must_err(import_value(&value));
        assert!(matches!(err, ExportError::MissingHash { index: 1 }));
        assert_eq!(err.to_string(), "node at index 1 missing hash");
    }

    #[test]
    fn node_with_unknown_type_is_malformed() {
        let mut value = exported_value(&purchase_trace());
        value["nodes"][0]["type"] = json!("THINK");
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::MalformedNode { index: 0, .. }
        ));
    }

    #[test]
    fn boundary_with_bad_node_id_is_malformed() {
        let mut value = exported_value(&purchase_trace());
        value["trust_boundaries"][1]["nodes"] = json!(["not-a-ulid"]);
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::MalformedBoundary { index: 1, .. }
        ));
    }

    #[test]
    fn timestamps_out_of_order_are_rejected() {
        let mut value = exported_value(&purchase_trace());
        value["nodes"][0]["timestamp"] = json!("2026-01-02T00:00:00Z");
        value["nodes"][1]["timestamp"] = json!("2026-01-01T00:00:00Z");
        let err = must_err(import_value(&value));
        assert!(matches!(err, ExportError::TimestampOrder { index: 1 }));
        assert!(err.to_string().contains("ordered by timestamp"));
    }

    #[test]
    fn import_orders_by_instant_not_by_text() {
        let mut value = exported_value(&purchase_trace());
        value["nodes"][0]["timestamp"] = json!("2026-01-01T01:00:00+02:00");
        value["nodes"][1]["timestamp"] = json!("2026-01-01T00:30:00Z");
        value["nodes"][2]["timestamp"] = json!("2026-01-01T00:30:00Z");
        value["nodes"][3]["timestamp"] = json!("2026-01-01T00:30:00Z");
        let imported = must_ok(import_value(&value));
        assert_eq!(imported.nodes().len(), 4);

        value["nodes"][0]["timestamp"] = json!("2026-01-01T00:30:00Z");
        value["nodes"][1]["timestamp"] = json!("2026-01-01T01:00:00+02:00");
        assert!(matches!(
            must_err(import_value(&value)),
            ExportError::TimestampOrder { index: 1 }
        ));
    }

    #[test]
    fn non_finite_confidence_is_not_exported() {
        let mut builder = TraceBuilder::new("agent-1", "Sensor read");
        let reading = must_ok(builder.observe("x", Some(f64::NAN)));
        must_ok(builder.set_boundary("sensor", &[reading.id], None));
        assert!(builder.verify().valid);

        let err = must_err(export_json(&builder));
        assert!(matches!(err, ExportError::NonFiniteConfidence { index: 0 }));
        assert_eq!(err.to_string(), "node at index 0 has a non-finite confidence");
        assert!(matches!(
            must_err(export_json_pretty(&builder)),
            ExportError::NonFiniteConfidence { index: 0 }
        ));
        assert!(matches!(
            must_err(export_record_json(&assemble_record(&builder, None))),
            ExportError::NonFiniteConfidence { index: 0 }
        ));

        let mut builder = purchase_trace();
        must_ok(builder.act("Notify", Some(f64::INFINITY)));
        assert!(matches!(
            must_err(export_json(&builder)),
            ExportError::NonFiniteConfidence { index: 4 }
        ));
    }

    #[test]
    fn imported_trace_is_read_only() {
        let mut imported = must_ok(import_json(&must_ok(export_json(&purchase_trace()))));
        assert_eq!(
            must_err(imported.append(NodeType::Observe, "y", &[], None, None)),
            TraceError::ReadOnlyViolation("append")
        );
        assert_eq!(
            must_err(imported.set_boundary("b2", &[], None)),
            TraceError::ReadOnlyViolation("set a boundary")
        );
        assert_eq!(imported.nodes().len(), 4);
    }

    #[test]
    fn empty_trace_round_trips() {
        let builder = TraceBuilder::new("a", "c");
        let imported = must_ok(import_json(&must_ok(export_json(&builder))));
        assert!(imported.nodes().is_empty());
        assert!(imported.verify().valid);
    }

    #[test]
    fn record_export_carries_status_and_outcome() {
        let record = assemble_record(&purchase_trace(), Some("approved"));
        let value: Value = must_ok(serde_json::from_str(&must_ok(export_record_json(&record))));
        assert_eq!(value["verification_status"], json!("verified"));
        assert_eq!(value["outcome"], json!("approved"));
        assert_eq!(value["trace"].as_array().map(Vec::len), Some(4));
    }
}
