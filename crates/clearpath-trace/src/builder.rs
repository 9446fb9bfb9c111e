use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use clearpath_domain::{
    CanonicalFields, DecisionMeta, NodeId, NodeType, TraceError, TraceHeader, TraceNode,
    TrustBoundary, GENESIS_PREVIOUS_HASH,
};
use serde_json::{Map, Value};
use time::UtcOffset;

use crate::evidence::check_evidence;
use crate::{Clock, SystemClock, TraceSource};

/// The mutable state of a trace: an append-only node chain plus its boundaries.
#[derive(Clone)]
pub struct TraceBuilder {
    header: TraceHeader,
    nodes: Vec<TraceNode>,
    boundaries: Vec<TrustBoundary>,
    positions: BTreeMap<NodeId, usize>,
    clock: Arc<dyn Clock>,
}

impl Debug for TraceBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceBuilder")
            .field("header", &self.header)
            .field("nodes", &self.nodes)
            .field("boundaries", &self.boundaries)
            .finish_non_exhaustive()
    }
}

impl TraceBuilder {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, context: impl Into<String>) -> Self {
        Self::with_clock(agent_id, context, Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(
        agent_id: impl Into<String>,
        context: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let created_at = clock.now().to_offset(UtcOffset::UTC);
        Self {
            header: TraceHeader::new(agent_id, context, created_at),
            nodes: Vec::new(),
            boundaries: Vec::new(),
            positions: BTreeMap::new(),
            clock,
        }
    }

    /// Appends one hashed node to the chain.
    ///
    /// # Errors
    /// Returns [`TraceError::UnknownEvidenceReference`] when an evidence id is
    /// not an already-appended node, and [`TraceError::NonMonotonicTimestamp`]
    /// when the clock has gone backwards since the previous node. Nothing is
    /// appended on error.
    pub fn append(
        &mut self,
        node_type: NodeType,
        content: impl Into<String>,
        evidence: &[NodeId],
        confidence: Option<f64>,
        meta: Option<Map<String, Value>>,
    ) -> Result<TraceNode, TraceError> {
        let position = self.nodes.len();
        check_evidence(evidence, &self.positions, position)
            .map_err(|violation| TraceError::UnknownEvidenceReference(violation.node_id()))?;

        let timestamp = self.clock.now().to_offset(UtcOffset::UTC);
        let previous_hash = match self.nodes.last() {
            Some(last) if timestamp < last.timestamp => {
                return Err(TraceError::NonMonotonicTimestamp {
                    previous: last.timestamp,
                    current: timestamp,
                });
            }
            Some(last) => last.hash.clone(),
            None => GENESIS_PREVIOUS_HASH.to_string(),
        };

        let content = content.into();
        let hash = CanonicalFields {
            previous_hash: &previous_hash,
            node_type,
            content: &content,
            evidence,
            timestamp,
            agent_id: &self.header.agent_id,
            confidence,
            meta: meta.as_ref(),
        }
        .digest();

        let node = TraceNode {
            id: NodeId::new(),
            node_type,
            content,
            evidence: evidence.to_vec(),
            timestamp,
            agent_id: self.header.agent_id.clone(),
            confidence,
            meta,
            hash,
            previous_hash,
        };

        self.positions.insert(node.id, position);
        self.nodes.push(node.clone());
        tracing::debug!(
            node_id = %node.id,
            node_type = %node.node_type,
            position,
            "appended trace node"
        );
        Ok(node)
    }

    /// # Errors
    /// See [`TraceBuilder::append`].
    pub fn observe(
        &mut self,
        content: impl Into<String>,
        confidence: Option<f64>,
    ) -> Result<TraceNode, TraceError> {
        self.append(NodeType::Observe, content, &[], confidence, None)
    }

    /// Records a conclusion justified by earlier nodes.
    ///
    /// # Errors
    /// See [`TraceBuilder::append`].
    pub fn derive(
        &mut self,
        content: impl Into<String>,
        evidence: &[NodeId],
        confidence: Option<f64>,
    ) -> Result<TraceNode, TraceError> {
        self.append(NodeType::Derive, content, evidence, confidence, None)
    }

    /// # Errors
    /// See [`TraceBuilder::append`].
    pub fn assume(
        &mut self,
        content: impl Into<String>,
        confidence: Option<f64>,
    ) -> Result<TraceNode, TraceError> {
        self.append(NodeType::Assume, content, &[], confidence, None)
    }

    /// Records a decision. Alternatives and reasoning go into the hashed `meta`.
    ///
    /// # Errors
    /// See [`TraceBuilder::append`].
    pub fn decide(
        &mut self,
        decision_text: impl Into<String>,
        decision: &DecisionMeta,
        evidence: &[NodeId],
        confidence: Option<f64>,
    ) -> Result<TraceNode, TraceError> {
        self.append(
            NodeType::Decide,
            decision_text,
            evidence,
            confidence,
            Some(decision.to_meta()),
        )
    }

    /// # Errors
    /// See [`TraceBuilder::append`].
    pub fn act(
        &mut self,
        content: impl Into<String>,
        confidence: Option<f64>,
    ) -> Result<TraceNode, TraceError> {
        self.append(NodeType::Act, content, &[], confidence, None)
    }

    /// Registers a trust boundary over already-appended nodes.
    ///
    /// Coverage of the whole trace is not required here; verification
    /// reports gaps.
    ///
    /// # Errors
    /// Returns [`TraceError::UnknownBoundaryNode`] for an id outside the trace
    /// and [`TraceError::DuplicateBoundaryAssignment`] for an id already
    /// claimed by an earlier boundary or listed twice in `node_ids`.
    pub fn set_boundary(
        &mut self,
        name: impl Into<String>,
        node_ids: &[NodeId],
        description: Option<&str>,
    ) -> Result<TrustBoundary, TraceError> {
        let mut claimed = self
            .boundaries
            .iter()
            .flat_map(|boundary| boundary.nodes.iter().copied())
            .collect::<BTreeSet<_>>();

        for node_id in node_ids {
            if !self.positions.contains_key(node_id) {
                return Err(TraceError::UnknownBoundaryNode(*node_id));
            }
            if !claimed.insert(*node_id) {
                return Err(TraceError::DuplicateBoundaryAssignment(*node_id));
            }
        }

        let boundary = TrustBoundary::new(name, description.unwrap_or_default(), node_ids.to_vec());
        self.boundaries.push(boundary.clone());
        tracing::debug!(
            boundary_id = %boundary.id,
            name = %boundary.name,
            nodes = boundary.nodes.len(),
            "registered trust boundary"
        );
        Ok(boundary)
    }

    /// Detached copy of the current header, nodes and boundaries.
    #[must_use]
    pub fn snapshot(&self) -> TraceSnapshot {
        TraceSnapshot {
            header: self.header.clone(),
            nodes: self.nodes.clone(),
            boundaries: self.boundaries.clone(),
        }
    }
}

impl TraceSource for TraceBuilder {
    fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    fn boundaries(&self) -> &[TrustBoundary] {
        &self.boundaries
    }
}

/// A trace reconstructed from an export. It has no write operations.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedTrace {
    header: TraceHeader,
    nodes: Vec<TraceNode>,
    boundaries: Vec<TrustBoundary>,
}

impl SealedTrace {
    /// Freezes stored parts as-is. Hashes are not recomputed.
    #[must_use]
    pub fn from_parts(
        header: TraceHeader,
        nodes: Vec<TraceNode>,
        boundaries: Vec<TrustBoundary>,
    ) -> Self {
        Self {
            header,
            nodes,
            boundaries,
        }
    }
}

impl TraceSource for SealedTrace {
    fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    fn boundaries(&self) -> &[TrustBoundary] {
        &self.boundaries
    }
}

/// Owned, freely editable copy of a trace's contents.
///
/// Nothing about a snapshot is trusted: it is what the verifier and the
/// record assembler are run against when the data did not come straight
/// from a builder.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSnapshot {
    pub header: TraceHeader,
    pub nodes: Vec<TraceNode>,
    pub boundaries: Vec<TrustBoundary>,
}

impl TraceSource for TraceSnapshot {
    fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn nodes(&self) -> &[TraceNode] {
        &self.nodes
    }

    fn boundaries(&self) -> &[TrustBoundary] {
        &self.boundaries
    }
}

/// A trace in one of its two lifecycle states.
#[derive(Debug, Clone)]
pub enum Trace {
    Mutable(TraceBuilder),
    ReadOnly(SealedTrace),
}

impl Trace {
    #[must_use]
    pub fn new(agent_id: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Mutable(TraceBuilder::new(agent_id, context))
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    /// Write access to the builder of a mutable trace.
    ///
    /// # Errors
    /// Returns [`TraceError::ReadOnlyViolation`] for a reconstructed trace.
    pub fn builder_mut(&mut self, operation: &'static str) -> Result<&mut TraceBuilder, TraceError> {
        match self {
            Self::Mutable(builder) => Ok(builder),
            Self::ReadOnly(_) => Err(TraceError::ReadOnlyViolation(operation)),
        }
    }

    /// # Errors
    /// Returns [`TraceError::ReadOnlyViolation`] for a reconstructed trace,
    /// otherwise see [`TraceBuilder::append`].
    pub fn append(
        &mut self,
        node_type: NodeType,
        content: impl Into<String>,
        evidence: &[NodeId],
        confidence: Option<f64>,
        meta: Option<Map<String, Value>>,
    ) -> Result<TraceNode, TraceError> {
        self.builder_mut("append")?
            .append(node_type, content, evidence, confidence, meta)
    }

    /// # Errors
    /// Returns [`TraceError::ReadOnlyViolation`] for a reconstructed trace,
    /// otherwise see [`TraceBuilder::set_boundary`].
    pub fn set_boundary(
        &mut self,
        name: impl Into<String>,
        node_ids: &[NodeId],
        description: Option<&str>,
    ) -> Result<TrustBoundary, TraceError> {
        self.builder_mut("set a boundary")?
            .set_boundary(name, node_ids, description)
    }
}

impl From<TraceBuilder> for Trace {
    fn from(value: TraceBuilder) -> Self {
        Self::Mutable(value)
    }
}

impl From<SealedTrace> for Trace {
    fn from(value: SealedTrace) -> Self {
        Self::ReadOnly(value)
    }
}

impl TraceSource for Trace {
    fn header(&self) -> &TraceHeader {
        match self {
            Self::Mutable(builder) => builder.header(),
            Self::ReadOnly(sealed) => sealed.header(),
        }
    }

    fn nodes(&self) -> &[TraceNode] {
        match self {
            Self::Mutable(builder) => builder.nodes(),
            Self::ReadOnly(sealed) => sealed.nodes(),
        }
    }

    fn boundaries(&self) -> &[TrustBoundary] {
        match self {
            Self::Mutable(builder) => builder.boundaries(),
            Self::ReadOnly(sealed) => sealed.boundaries(),
        }
    }
}
