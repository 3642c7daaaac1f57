//! Persistence-facing domain records (spec §3.1, grounding §6's table list):
//! documents, claims, metrics, relationships, snapshots, and deltas. These
//! back the storage traits in [`crate::persistence`] and exist independently
//! of run-time-only types like [`crate::state::RunState`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{Timestamp, UnitScore};

macro_rules! uuid_id {
    ($name:ident) => {
        #[nutype::nutype(derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display
        ))]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random id.
            #[must_use]
            pub fn generate() -> Self {
                Self::new(Uuid::new_v4())
            }
        }
    };
}

uuid_id!(DocumentId);
uuid_id!(SegmentId);
uuid_id!(EntityId);
uuid_id!(ClaimId);
uuid_id!(MetricId);
uuid_id!(RelationshipId);
uuid_id!(SnapshotId);
uuid_id!(DeltaId);

/// The business object a run targets. Drives publish versioning (spec §6):
/// certification uses semver, topic uses dated tags, lab uses
/// `suite-id-<hash>`, story uses zero-padded episode numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeType {
    /// A certification track, e.g. `az-104`.
    Certification,
    /// A dated topic/dossier scope.
    Topic,
    /// A lab/test-suite scope.
    Lab,
    /// A serialized-story/world scope.
    Story,
}

/// Identifier for a scope instance, e.g. a certification id or a world id.
#[nutype::nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom)
)]
pub struct ScopeId(String);

/// A source document ingested into the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Unique id.
    pub id: DocumentId,
    /// Scope this document was ingested for.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Content hash, for dedup/change detection.
    pub content_hash: String,
    /// When this document was ingested.
    pub ingested_at: Timestamp,
}

/// A contiguous span of a [`SourceDocument`], the unit claims cite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    /// Unique id.
    pub id: SegmentId,
    /// Parent document.
    pub document_id: DocumentId,
    /// Segment's textual content.
    pub text: String,
    /// Ordinal position within the document.
    pub ordinal: u32,
}

/// A named entity extracted from source material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Unique id.
    pub id: EntityId,
    /// Scope this entity belongs to.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Canonical display name.
    pub name: String,
    /// Free-form entity kind, e.g. `"product"`, `"person"`.
    pub kind: String,
}

/// A pointer from a claim to the document/segment that supports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationRef {
    /// The cited document.
    pub document_id: DocumentId,
    /// The cited segment within that document.
    pub segment_id: SegmentId,
}

/// Lifecycle status of a [`Claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    /// Currently believed true and citable.
    Active,
    /// Replaced by a newer claim in its `supersedes` chain.
    Superseded,
    /// Withdrawn without a replacement.
    Retracted,
}

/// A single statement with provenance, produced by an agent and validated
/// against the citation-provenance invariant (spec §8) before publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    /// Unique id.
    pub id: ClaimId,
    /// Scope this claim belongs to.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Statement text.
    pub statement: String,
    /// Supporting citations; must be non-empty for a claim to publish.
    pub citations: Vec<CitationRef>,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: UnitScore,
    /// Current lifecycle status.
    pub status: ClaimStatus,
    /// Ids of claims this one supersedes, oldest first.
    pub supersedes: Vec<ClaimId>,
}

impl Claim {
    /// Citation-provenance invariant (spec §8): non-empty citations, each
    /// resolving to a document/segment known to `known_segments`.
    #[must_use]
    pub fn has_valid_citations(&self, known_segments: &BTreeSet<(DocumentId, SegmentId)>) -> bool {
        !self.citations.is_empty()
            && self
                .citations
                .iter()
                .all(|c| known_segments.contains(&(c.document_id, c.segment_id)))
    }
}

/// A named metric tracked for a scope, e.g. `"pass_rate"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    /// Unique id.
    pub id: MetricId,
    /// Scope this metric belongs to.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Metric name.
    pub name: String,
    /// Unit of measurement, e.g. `"percent"`.
    pub unit: String,
}

/// A single observation of a [`Metric`] at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Parent metric.
    pub metric_id: MetricId,
    /// Observed value.
    pub value: f64,
    /// When this value was observed.
    pub observed_at: Timestamp,
}

/// A directed relationship between two entities, e.g. `"depends_on"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    /// Unique id.
    pub id: RelationshipId,
    /// Source entity.
    pub from_entity: EntityId,
    /// Target entity.
    pub to_entity: EntityId,
    /// Relationship kind.
    pub kind: String,
}

/// An immutable, content-addressed projection of all active claims and
/// metrics for a scope at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Unique id.
    pub id: SnapshotId,
    /// Scope this snapshot covers.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Claim ids included, in the order they were assembled.
    pub claim_ids: Vec<ClaimId>,
    /// Metric ids included.
    pub metric_ids: Vec<MetricId>,
    /// When this snapshot was taken.
    pub taken_at: Timestamp,
}

impl Snapshot {
    /// Content hash over the (order-independent) set of included claim and
    /// metric ids. Hashing the same snapshot twice yields the same value
    /// (spec §8 round-trip law); changing any included claim id changes it.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut claim_ids: Vec<String> = self.claim_ids.iter().map(ToString::to_string).collect();
        claim_ids.sort_unstable();
        let mut metric_ids: Vec<String> = self.metric_ids.iter().map(ToString::to_string).collect();
        metric_ids.sort_unstable();

        let mut hasher = Sha256::new();
        for id in &claim_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
        }
        hasher.update(b"--metrics--");
        for id in &metric_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\0");
        }
        let digest = hasher.finalize();
        hex_encode(&digest)
    }

    /// Computes the structural delta between two snapshots: claims/metrics
    /// present in `to` but not `from` are additions, present in `from` but
    /// not `to` are removals. A pure set diff: per-item content changes
    /// aren't tracked (claims are immutable once created; a "changed" claim
    /// is modeled as superseding the old one, i.e. a remove-then-add).
    #[must_use]
    pub fn diff(from: &Snapshot, to: &Snapshot, id: DeltaId) -> Delta {
        let from_claims: BTreeSet<_> = from.claim_ids.iter().copied().collect();
        let to_claims: BTreeSet<_> = to.claim_ids.iter().copied().collect();
        let from_metrics: BTreeSet<_> = from.metric_ids.iter().copied().collect();
        let to_metrics: BTreeSet<_> = to.metric_ids.iter().copied().collect();

        let mut claim_changes: Vec<ClaimChange> = to_claims
            .difference(&from_claims)
            .map(|id| ClaimChange { claim_id: *id, kind: ChangeKind::Added })
            .chain(
                from_claims
                    .difference(&to_claims)
                    .map(|id| ClaimChange { claim_id: *id, kind: ChangeKind::Removed }),
            )
            .collect();
        claim_changes.sort_by_key(|c| c.claim_id);

        let mut metric_changes: Vec<MetricChange> = to_metrics
            .difference(&from_metrics)
            .map(|id| MetricChange { metric_id: *id, kind: ChangeKind::Added })
            .chain(
                from_metrics
                    .difference(&to_metrics)
                    .map(|id| MetricChange { metric_id: *id, kind: ChangeKind::Removed }),
            )
            .collect();
        metric_changes.sort_by_key(|c| c.metric_id);

        Delta {
            id,
            from_snapshot: from.id,
            to_snapshot: to.id,
            claim_changes,
            metric_changes,
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Whether an item was added or removed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Present in `to` but not `from`.
    Added,
    /// Present in `from` but not `to`.
    Removed,
}

/// A single claim's membership change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimChange {
    /// The claim whose presence changed.
    pub claim_id: ClaimId,
    /// Whether it was added or removed.
    pub kind: ChangeKind,
}

/// A single metric's membership change between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricChange {
    /// The metric whose presence changed.
    pub metric_id: MetricId,
    /// Whether it was added or removed.
    pub kind: ChangeKind,
}

/// A structured add/remove change between two snapshots (spec §3.1, §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Unique id.
    pub id: DeltaId,
    /// The snapshot this delta starts from.
    pub from_snapshot: SnapshotId,
    /// The snapshot this delta arrives at.
    pub to_snapshot: SnapshotId,
    /// Claim membership changes, sorted by claim id.
    pub claim_changes: Vec<ClaimChange>,
    /// Metric membership changes, sorted by metric id.
    pub metric_changes: Vec<MetricChange>,
}

impl Delta {
    /// Composes `self: a→b` with `next: b→c` into a single `a→c` delta
    /// (spec §8 round-trip law: `delta(a,c) = delta(a,b) ⊕ delta(b,c)`).
    /// An item added then removed (or removed then re-added) nets to no
    /// change and is dropped, matching what a direct `Snapshot::diff(a, c)`
    /// would produce.
    #[must_use]
    pub fn compose(&self, next: &Delta, id: DeltaId) -> Delta {
        let claim_changes = compose_changes(
            self.claim_changes.iter().map(|c| (c.claim_id, c.kind)),
            next.claim_changes.iter().map(|c| (c.claim_id, c.kind)),
        )
        .into_iter()
        .map(|(claim_id, kind)| ClaimChange { claim_id, kind })
        .collect();

        let metric_changes = compose_changes(
            self.metric_changes.iter().map(|c| (c.metric_id, c.kind)),
            next.metric_changes.iter().map(|c| (c.metric_id, c.kind)),
        )
        .into_iter()
        .map(|(metric_id, kind)| MetricChange { metric_id, kind })
        .collect();

        Delta {
            id,
            from_snapshot: self.from_snapshot,
            to_snapshot: next.to_snapshot,
            claim_changes,
            metric_changes,
        }
    }
}

fn compose_changes<I: Ord + Copy>(
    first: impl Iterator<Item = (I, ChangeKind)>,
    second: impl Iterator<Item = (I, ChangeKind)>,
) -> Vec<(I, ChangeKind)> {
    let mut merged: BTreeMap<I, ChangeKind> = first.collect();
    for (item, kind) in second {
        match (merged.get(&item).copied(), kind) {
            (Some(ChangeKind::Added), ChangeKind::Removed) | (Some(ChangeKind::Removed), ChangeKind::Added) => {
                merged.remove(&item);
            }
            (_, kind) => {
                merged.insert(item, kind);
            }
        }
    }
    merged.into_iter().collect()
}

/// Lifecycle state of an orchestrator run (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet walking any node.
    Pending,
    /// Actively walking nodes.
    Running,
    /// Reached a terminal node without crossing the degradation threshold.
    Succeeded,
    /// Aborted by a fatal, non-retryable error.
    Failed,
    /// Reached a terminal node after crossing the budget degradation
    /// threshold at some node.
    Degraded,
}

/// Unique identifier for a run, re-exported at the domain root as
/// [`super::RunId`]; kept here too since persistence records reference it
/// alongside the other record ids in this module.
pub use super::RunId;

/// The durable record of one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique id.
    pub id: RunId,
    /// Scope this run targets.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the run ended, if it has.
    pub ended_at: Option<Timestamp>,
}

/// A structured, redacted event emitted during a run (spec §7 "every
/// failure emits a structured event with redacted payloads").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// The run this event belongs to.
    pub run_id: RunId,
    /// Event kind, e.g. `"budget_degraded"`, `"node_failed"`.
    pub kind: String,
    /// Redacted structured payload.
    pub payload: serde_json::Value,
    /// When this event occurred.
    pub occurred_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: u8, claims: &[u8]) -> Snapshot {
        Snapshot {
            id: SnapshotId::generate(),
            scope_type: ScopeType::Certification,
            scope_id: ScopeId::try_new(format!("scope-{id}")).unwrap(),
            claim_ids: claims.iter().map(|_| ClaimId::generate()).collect(),
            metric_ids: Vec::new(),
            taken_at: chrono::Utc::now(),
        }
    }

    fn fixed_claims(n: usize) -> Vec<ClaimId> {
        (0..n).map(|_| ClaimId::generate()).collect()
    }

    #[test]
    fn hashing_the_same_snapshot_twice_is_idempotent() {
        let snap = snapshot(1, &[1, 2, 3]);
        assert_eq!(snap.content_hash(), snap.content_hash());
    }

    #[test]
    fn changing_an_included_claim_id_changes_the_hash() {
        let pool = fixed_claims(3);
        let a = Snapshot {
            claim_ids: pool.clone(),
            ..snapshot(1, &[])
        };
        let mut altered = pool.clone();
        altered[0] = ClaimId::generate();
        let b = Snapshot {
            claim_ids: altered,
            ..snapshot(1, &[])
        };
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn hash_is_order_independent() {
        let pool = fixed_claims(4);
        let mut reversed = pool.clone();
        reversed.reverse();
        let a = Snapshot { claim_ids: pool, ..snapshot(1, &[]) };
        let b = Snapshot { claim_ids: reversed, ..snapshot(1, &[]) };
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn delta_composition_matches_direct_diff() {
        let pool = fixed_claims(6);
        let a = Snapshot {
            claim_ids: vec![pool[0], pool[1], pool[2]],
            ..snapshot(1, &[])
        };
        let b = Snapshot {
            claim_ids: vec![pool[1], pool[2], pool[3]],
            ..snapshot(2, &[])
        };
        let c = Snapshot {
            claim_ids: vec![pool[2], pool[3], pool[4]],
            ..snapshot(3, &[])
        };

        let direct = Snapshot::diff(&a, &c, DeltaId::generate());
        let d_ab = Snapshot::diff(&a, &b, DeltaId::generate());
        let d_bc = Snapshot::diff(&b, &c, DeltaId::generate());
        let composed = d_ab.compose(&d_bc, DeltaId::generate());

        let mut direct_changes = direct.claim_changes.clone();
        let mut composed_changes = composed.claim_changes.clone();
        direct_changes.sort_by_key(|c| c.claim_id);
        composed_changes.sort_by_key(|c| c.claim_id);
        assert_eq!(direct_changes, composed_changes);
    }

    #[test]
    fn claim_with_empty_citations_fails_provenance_check() {
        let claim = Claim {
            id: ClaimId::generate(),
            scope_type: ScopeType::Lab,
            scope_id: ScopeId::try_new("suite-01").unwrap(),
            statement: "the suite passed".to_string(),
            citations: Vec::new(),
            confidence: UnitScore::clamp(0.9),
            status: ClaimStatus::Active,
            supersedes: Vec::new(),
        };
        assert!(!claim.has_valid_citations(&BTreeSet::new()));
    }

    #[test]
    fn claim_with_resolving_citation_passes_provenance_check() {
        let doc = DocumentId::generate();
        let seg = SegmentId::generate();
        let claim = Claim {
            id: ClaimId::generate(),
            scope_type: ScopeType::Lab,
            scope_id: ScopeId::try_new("suite-01").unwrap(),
            statement: "the suite passed".to_string(),
            citations: vec![CitationRef { document_id: doc, segment_id: seg }],
            confidence: UnitScore::clamp(0.9),
            status: ClaimStatus::Active,
            supersedes: Vec::new(),
        };
        let mut known = BTreeSet::new();
        known.insert((doc, seg));
        assert!(claim.has_valid_citations(&known));
    }
}
