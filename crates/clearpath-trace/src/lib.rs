//! Hash-chain builder, chain verifier and decision-record assembly for
//! CAP-1.0 traces.
//!
//! A trace is either [`Trace::Mutable`], grown one node at a time through a
//! [`TraceBuilder`], or [`Trace::ReadOnly`], reconstructed from an export and
//! never writable again. Verification is a pure function over node and
//! boundary slices and can run against any [`TraceSource`].

#![forbid(unsafe_code)]

mod boundary;
mod builder;
mod evidence;
mod record;
mod verify;

use clearpath_domain::{now_utc, DateTimeUtc, TraceHeader, TraceNode, TrustBoundary};

pub use boundary::{owning_boundary, validate_boundary_coverage, BoundaryCoverageError};
pub use builder::{SealedTrace, Trace, TraceBuilder, TraceSnapshot};
pub use evidence::{check_evidence, index_positions, EvidenceViolation};
pub use record::{assemble_record, DecisionRecord, VerificationStatus};
pub use verify::{verify_trace, NodeViolation, VerifyResult};

/// Source of node timestamps for a builder.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTimeUtc;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTimeUtc {
        now_utc()
    }
}

/// Read access shared by every trace representation.
pub trait TraceSource {
    fn header(&self) -> &TraceHeader;

    fn nodes(&self) -> &[TraceNode];

    fn boundaries(&self) -> &[TrustBoundary];

    fn verify(&self) -> VerifyResult {
        verify_trace(self.nodes(), self.boundaries())
    }
}
