use std::collections::BTreeSet;

use clearpath_domain::{NodeId, TrustBoundary};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum BoundaryCoverageError {
    #[error("boundary \"{boundary}\" references unknown node {node_id}")]
    UnknownNode { boundary: String, node_id: NodeId },
    #[error("node {0} belongs to more than one trust boundary")]
    Overlap(NodeId),
    #[error("node {0} does not belong to any trust boundary")]
    Uncovered(NodeId),
}

/// Checks that `boundaries` partition `node_ids` exactly.
///
/// Boundary order is irrelevant. An empty node set is covered only by
/// boundaries that reference no node at all.
///
/// # Errors
/// Returns the first reference to an id outside `node_ids`, the first id
/// claimed twice, or (after all boundaries are scanned) the first id in
/// `node_ids` order that no boundary claims.
pub fn validate_boundary_coverage(
    node_ids: &[NodeId],
    boundaries: &[TrustBoundary],
) -> Result<(), BoundaryCoverageError> {
    let known = node_ids.iter().copied().collect::<BTreeSet<_>>();
    let mut claimed = BTreeSet::new();

    for boundary in boundaries {
        for node_id in &boundary.nodes {
            if !known.contains(node_id) {
                return Err(BoundaryCoverageError::UnknownNode {
                    boundary: boundary.name.clone(),
                    node_id: *node_id,
                });
            }
            if !claimed.insert(*node_id) {
                return Err(BoundaryCoverageError::Overlap(*node_id));
            }
        }
    }

    match node_ids.iter().find(|node_id| !claimed.contains(*node_id)) {
        Some(node_id) => Err(BoundaryCoverageError::Uncovered(*node_id)),
        None => Ok(()),
    }
}

/// First boundary claiming `node_id`, if any.
#[must_use]
pub fn owning_boundary(node_id: NodeId, boundaries: &[TrustBoundary]) -> Option<&TrustBoundary> {
    boundaries.iter().find(|boundary| boundary.contains(node_id))
}
