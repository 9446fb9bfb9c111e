use std::collections::BTreeMap;

use clearpath_domain::{NodeId, TraceNode, TrustBoundary, GENESIS_PREVIOUS_HASH};
use serde::{Deserialize, Serialize};

use crate::boundary::validate_boundary_coverage;
use crate::evidence::{check_evidence, index_positions, EvidenceViolation};

/// Outcome of replaying a trace.
///
/// `broken_at` is set when the defect belongs to one node; boundary
/// partition failures are trace-wide and leave it empty.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct VerifyResult {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VerifyResult {
    #[must_use]
    pub fn valid() -> Self {
        Self {
            valid: true,
            broken_at: None,
            error: None,
        }
    }

    #[must_use]
    pub fn broken_at(node_id: NodeId, reason: impl ToString) -> Self {
        Self {
            valid: false,
            broken_at: Some(node_id),
            error: Some(reason.to_string()),
        }
    }

    #[must_use]
    pub fn structural(reason: impl ToString) -> Self {
        Self {
            valid: false,
            broken_at: None,
            error: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum NodeViolation {
    #[error("previous_hash mismatch")]
    PreviousHashMismatch,
    #[error("hash mismatch")]
    HashMismatch,
    #[error(transparent)]
    Evidence(#[from] EvidenceViolation),
    #[error("node id {0} repeats an earlier node")]
    DuplicateId(NodeId),
}

/// Replays the hash chain, evidence ordering and boundary partition.
///
/// Nodes are checked in stored order and the first violation wins. The
/// inputs are only read, so the same snapshot can be verified any number of
/// times, from any number of threads.
#[must_use]
pub fn verify_trace(nodes: &[TraceNode], boundaries: &[TrustBoundary]) -> VerifyResult {
    let positions = index_positions(nodes);
    let mut expected_previous = GENESIS_PREVIOUS_HASH;

    for (position, node) in nodes.iter().enumerate() {
        if let Err(violation) = check_node(node, position, expected_previous, &positions) {
            tracing::warn!(node_id = %node.id, position, %violation, "trace chain broken");
            return VerifyResult::broken_at(node.id, violation);
        }
        expected_previous = &node.hash;
    }

    let node_ids = nodes.iter().map(|node| node.id).collect::<Vec<_>>();
    if let Err(err) = validate_boundary_coverage(&node_ids, boundaries) {
        tracing::warn!(error = %err, "trust boundary partition invalid");
        return VerifyResult::structural(err);
    }

    tracing::debug!(nodes = nodes.len(), boundaries = boundaries.len(), "trace verified");
    VerifyResult::valid()
}

fn check_node(
    node: &TraceNode,
    position: usize,
    expected_previous: &str,
    positions: &BTreeMap<NodeId, usize>,
) -> Result<(), NodeViolation> {
    if node.previous_hash != expected_previous {
        return Err(NodeViolation::PreviousHashMismatch);
    }
    if node.recompute_hash() != node.hash {
        return Err(NodeViolation::HashMismatch);
    }
    check_evidence(&node.evidence, positions, position)?;
    if positions.get(&node.id) != Some(&position) {
        return Err(NodeViolation::DuplicateId(node.id));
    }
    Ok(())
}
