use clearpath_domain::{now_utc, DateTimeUtc, RecordId, TraceNode, TrustBoundary};
use serde::{Deserialize, Serialize};

use crate::TraceSource;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Part of the record vocabulary; [`assemble_record`] never produces it.
    Unverified,
    Verified,
    Tampered,
}

impl VerificationStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unverified => "unverified",
            Self::Verified => "verified",
            Self::Tampered => "tampered",
        }
    }
}

/// Frozen copy of a trace plus the outcome it led to.
///
/// Serialize-only: [`assemble_record`] is the one constructor, so the status
/// always comes from an actual verification.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DecisionRecord {
    id: RecordId,
    trace: Vec<TraceNode>,
    trust_boundaries: Vec<TrustBoundary>,
    schema_version: String,
    #[serde(with = "time::serde::rfc3339")]
    created_at: DateTimeUtc,
    #[serde(with = "time::serde::rfc3339")]
    recorded_at: DateTimeUtc,
    agent_id: String,
    context: String,
    outcome: Option<String>,
    verification_status: VerificationStatus,
}

impl DecisionRecord {
    #[must_use]
    pub fn id(&self) -> RecordId {
        self.id
    }

    #[must_use]
    pub fn trace(&self) -> &[TraceNode] {
        &self.trace
    }

    #[must_use]
    pub fn trust_boundaries(&self) -> &[TrustBoundary] {
        &self.trust_boundaries
    }

    #[must_use]
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    #[must_use]
    pub fn created_at(&self) -> DateTimeUtc {
        self.created_at
    }

    #[must_use]
    pub fn recorded_at(&self) -> DateTimeUtc {
        self.recorded_at
    }

    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    #[must_use]
    pub fn context(&self) -> &str {
        &self.context
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&str> {
        self.outcome.as_deref()
    }

    #[must_use]
    pub fn verification_status(&self) -> VerificationStatus {
        self.verification_status
    }
}

/// Snapshots `source` into a [`DecisionRecord`], verifying it exactly once.
#[must_use]
pub fn assemble_record<S: TraceSource + ?Sized>(source: &S, outcome: Option<&str>) -> DecisionRecord {
    let verification_status = if source.verify().valid {
        VerificationStatus::Verified
    } else {
        VerificationStatus::Tampered
    };
    let header = source.header();

    let record = DecisionRecord {
        id: RecordId::new(),
        trace: source.nodes().to_vec(),
        trust_boundaries: source.boundaries().to_vec(),
        schema_version: header.schema_version.clone(),
        created_at: header.created_at,
        recorded_at: now_utc(),
        agent_id: header.agent_id.clone(),
        context: header.context.clone(),
        outcome: outcome.map(str::to_string),
        verification_status,
    };
    tracing::info!(
        record_id = %record.id,
        status = record.verification_status.as_str(),
        nodes = record.trace.len(),
        "assembled decision record"
    );
    record
}

#[cfg(test)]
mod tests {
    use clearpath_domain::{DecisionMeta, SCHEMA_VERSION};
    use serde_json::json;

    use super::*;
    use crate::TraceBuilder;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn escalation_trace() -> TraceBuilder {
        let mut builder = TraceBuilder::new("agent-1", "Triage request");
        let ticket = must_ok(builder.observe("Incoming ticket", None));
        let tier = must_ok(builder.observe("User tier: enterprise", None));
        let priority = must_ok(builder.derive("High priority", &[ticket.id, tier.id], None));
        let decision = DecisionMeta::new(
            vec!["Handle locally".to_string(), "Close as duplicate".to_string()],
            "Enterprise tier requires dedicated handling",
        );
        let escalate = must_ok(builder.decide("Escalate", &decision, &[], None));
        must_ok(builder.set_boundary(
            "agent_1",
            &[ticket.id, tier.id, priority.id, escalate.id],
            None,
        ));
        builder
    }

    #[test]
    fn escalation_scenario_is_verified() {
        let builder = escalation_trace();
        assert!(builder.verify().valid);

        let record = assemble_record(&builder, Some("Escalated to agent-2"));
        assert_eq!(record.verification_status(), VerificationStatus::Verified);
        assert_eq!(record.schema_version(), SCHEMA_VERSION);
        assert_eq!(record.trace().len(), 4);
        assert_eq!(record.trust_boundaries().len(), 1);
        assert_eq!(record.agent_id(), "agent-1");
        assert_eq!(record.context(), "Triage request");
        assert_eq!(record.outcome(), Some("Escalated to agent-2"));
        assert_eq!(record.created_at(), builder.header().created_at);
    }

    #[test]
    fn tampered_snapshot_yields_tampered_status() {
        let builder = escalation_trace();
        let mut snapshot = builder.snapshot();
        snapshot.nodes[0].content = "tampered".to_string();

        let record = assemble_record(&snapshot, None);
        assert_eq!(record.verification_status(), VerificationStatus::Tampered);
        assert_eq!(record.outcome(), None);
    }

    #[test]
    fn repeated_assembly_keeps_status_but_not_id() {
        let builder = escalation_trace();
        let first = assemble_record(&builder, None);
        let second = assemble_record(&builder, None);

        assert_eq!(first.verification_status(), second.verification_status());
        assert_ne!(first.id(), second.id());
    }

    #[test]
    fn record_is_a_copy_not_a_view() {
        let mut builder = escalation_trace();
        let record = assemble_record(&builder, None);
        must_ok(builder.act("after the fact", None));

        assert_eq!(record.trace().len(), 4);
        assert_eq!(builder.nodes().len(), 5);
    }

    #[test]
    fn record_serializes_status_in_snake_case_and_null_outcome() {
        let record = assemble_record(&escalation_trace(), None);
        let value = must_ok(serde_json::to_value(&record));
        assert_eq!(value["verification_status"], json!("verified"));
        assert_eq!(value["outcome"], serde_json::Value::Null);
        assert_eq!(value["schema_version"], json!(SCHEMA_VERSION));
    }

    #[test]
    fn status_reads_back_from_its_wire_name() {
        for status in [
            VerificationStatus::Unverified,
            VerificationStatus::Verified,
            VerificationStatus::Tampered,
        ] {
            let parsed: VerificationStatus = must_ok(serde_json::from_value(json!(status.as_str())));
            assert_eq!(parsed, status);
        }
    }
}
