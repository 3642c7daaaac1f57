//! Domain types shared by the routing, dispatch, agent, and orchestration
//! layers.

pub mod persistence;
pub mod statistics;
pub mod types;

pub use persistence::{
    ChangeKind, CitationRef, Claim, ClaimChange, ClaimId, ClaimStatus, Delta, DeltaId, DocumentId,
    Entity, EntityId, Metric, MetricChange, MetricId, MetricPoint, Relationship, RelationshipId,
    RunEvent, RunRecord, RunStatus, ScopeId, ScopeType, Segment, SegmentId, Snapshot, SnapshotId,
};
pub use types::*;
