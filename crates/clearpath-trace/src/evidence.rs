use std::collections::BTreeMap;

use clearpath_domain::{NodeId, TraceNode};

/// Why an evidence reference is not acceptable at a given chain position.
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
pub enum EvidenceViolation {
    #[error("evidence id {0} not found in trace")]
    Missing(NodeId),
    #[error("evidence id {0} must reference an earlier node")]
    NotEarlier(NodeId),
}

impl EvidenceViolation {
    #[must_use]
    pub fn node_id(self) -> NodeId {
        match self {
            Self::Missing(node_id) | Self::NotEarlier(node_id) => node_id,
        }
    }
}

/// Maps each node id to the position of its first occurrence.
#[must_use]
pub fn index_positions(nodes: &[TraceNode]) -> BTreeMap<NodeId, usize> {
    let mut positions = BTreeMap::new();
    for (position, node) in nodes.iter().enumerate() {
        positions.entry(node.id).or_insert(position);
    }
    positions
}

/// Checks that every evidence id names a node strictly before `position`.
///
/// The builder calls this with only the already-appended nodes indexed and
/// `position` equal to the next slot; the verifier calls it with the whole
/// trace indexed and the node's own position.
///
/// # Errors
/// Returns the first offending reference, in evidence order.
pub fn check_evidence(
    evidence: &[NodeId],
    positions: &BTreeMap<NodeId, usize>,
    position: usize,
) -> Result<(), EvidenceViolation> {
    for evidence_id in evidence {
        match positions.get(evidence_id) {
            None => return Err(EvidenceViolation::Missing(*evidence_id)),
            Some(found) if *found >= position => {
                return Err(EvidenceViolation::NotEarlier(*evidence_id));
            }
            Some(_) => {}
        }
    }
    Ok(())
}
