//! `SQLite`-backed implementations of the orchestrator's persistence seams
//! (`CheckpointStore`, `RoutingDecisionSink`) plus DAOs for the
//! external-interface tables named in spec §6: claims, snapshots, and
//! deltas. Built on [`crate::database::DatabaseConnection`]; follows the
//! teacher's `storage/*_storage.rs` split of SQL constants, a `Once`-guarded
//! schema init, and a thin trait-implementing struct around the pool.

use std::collections::HashMap;
use std::sync::Once;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::Row;
use tracing::{info, instrument};

use crate::database::{DatabaseConnection, DatabaseResult};
use crate::domain::{NodeId, ProviderName, RunId, Tier, UnitScore};
use crate::domain::{Claim, ClaimId, ClaimStatus, Delta, DeltaId, Snapshot, SnapshotId};
use crate::orchestrator::{CheckpointStore, RoutingDecisionRecord, RoutingDecisionSink};

const CREATE_CHECKPOINTS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS checkpoints (
        run_id TEXT PRIMARY KEY,
        completed_node TEXT NOT NULL,
        state_json TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

const UPSERT_CHECKPOINT: &str = r"
    INSERT OR REPLACE INTO checkpoints (run_id, completed_node, state_json, updated_at)
    VALUES (?1, ?2, ?3, ?4)
";

const SELECT_CHECKPOINT: &str = r"
    SELECT completed_node, state_json FROM checkpoints WHERE run_id = ?1
";

const CREATE_ROUTING_DECISIONS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS routing_decisions (
        run_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        request_tier INTEGER NOT NULL,
        chosen_tier INTEGER NOT NULL,
        provider_name TEXT,
        reason TEXT NOT NULL,
        confidence REAL NOT NULL,
        complexity REAL NOT NULL,
        latency_ms INTEGER NOT NULL,
        recorded_at INTEGER NOT NULL
    )
";

const INSERT_ROUTING_DECISION: &str = r"
    INSERT INTO routing_decisions
        (run_id, node_id, agent_id, request_tier, chosen_tier, provider_name, reason, confidence, complexity, latency_ms, recorded_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
";

static TABLE_CREATED: Once = Once::new();

/// `SQLite` implementation of [`CheckpointStore`] and [`RoutingDecisionSink`],
/// sharing one connection pool.
pub struct SqliteRunStore {
    connection: DatabaseConnection,
}

impl SqliteRunStore {
    /// Creates a new store over `connection`. Schema creation is deferred
    /// to first use (idempotent `CREATE TABLE IF NOT EXISTS`).
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    #[instrument(skip(self), err)]
    async fn ensure_schema(&self) -> DatabaseResult<()> {
        TABLE_CREATED.call_once(|| {
            info!("initializing run-store schema");
        });
        sqlx::query(CREATE_CHECKPOINTS_TABLE).execute(self.connection.pool()).await?;
        sqlx::query(CREATE_ROUTING_DECISIONS_TABLE).execute(self.connection.pool()).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteRunStore {
    async fn save_checkpoint(
        &self,
        run_id: RunId,
        completed_node: &NodeId,
        state: &HashMap<String, Value>,
    ) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        let state_json = serde_json::to_string(state)?;
        let updated_at = chrono::Utc::now().timestamp();
        sqlx::query(UPSERT_CHECKPOINT)
            .bind(run_id.to_string())
            .bind(completed_node.to_string())
            .bind(state_json)
            .bind(updated_at)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    async fn load_checkpoint(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Option<(NodeId, HashMap<String, Value>)>> {
        self.ensure_schema().await?;
        let row = sqlx::query(SELECT_CHECKPOINT)
            .bind(run_id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let completed_node: String = row.try_get("completed_node")?;
        let state_json: String = row.try_get("state_json")?;
        let node_id = NodeId::try_new(completed_node)
            .map_err(|e| anyhow::anyhow!("invalid checkpointed node id: {e}"))?;
        let state: HashMap<String, Value> = serde_json::from_str(&state_json)?;
        Ok(Some((node_id, state)))
    }
}

#[async_trait]
impl RoutingDecisionSink for SqliteRunStore {
    async fn record(&self, decision: RoutingDecisionRecord) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        sqlx::query(INSERT_ROUTING_DECISION)
            .bind(decision.run_id.to_string())
            .bind(decision.node_id.to_string())
            .bind(decision.agent_id.to_string())
            .bind(i64::from(decision.request_tier.as_u8()))
            .bind(i64::from(decision.chosen_tier.as_u8()))
            .bind(decision.provider_name.map(|p| p.to_string()))
            .bind(decision.reason)
            .bind(decision.confidence.into_inner())
            .bind(decision.complexity.into_inner())
            .bind(i64::try_from(decision.latency_ms).unwrap_or(i64::MAX))
            .bind(decision.timestamp.timestamp())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }
}

impl SqliteRunStore {
    /// Loads routing decisions for `run_id` in recording order, for the
    /// `tune-router` CLI command's threshold analysis.
    pub async fn routing_decisions_for_run(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Vec<RoutingDecisionRow>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT run_id, node_id, agent_id, request_tier, chosen_tier, provider_name, reason, confidence, complexity, latency_ms, recorded_at \
             FROM routing_decisions WHERE run_id = ?1 ORDER BY rowid ASC",
        )
        .bind(run_id.to_string())
        .fetch_all(self.connection.pool())
        .await?;

        rows.into_iter().map(row_to_decision(run_id)).collect()
    }

    /// Loads every routing decision recorded across every run, in recording
    /// order, for the `tune-router` CLI command's threshold analysis.
    pub async fn all_routing_decisions(&self) -> anyhow::Result<Vec<RoutingDecisionRow>> {
        self.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT run_id, node_id, agent_id, request_tier, chosen_tier, provider_name, reason, confidence, complexity, latency_ms, recorded_at \
             FROM routing_decisions ORDER BY rowid ASC",
        )
        .fetch_all(self.connection.pool())
        .await?;

        rows.into_iter()
            .map(|row| {
                let run_id_str: String = row.try_get("run_id")?;
                let run_id = RunId::new(
                    uuid::Uuid::parse_str(&run_id_str)
                        .map_err(|e| anyhow::anyhow!("invalid stored run id: {e}"))?,
                );
                row_to_decision(run_id)(row)
            })
            .collect()
    }
}

fn row_to_decision(run_id: RunId) -> impl Fn(sqlx::sqlite::SqliteRow) -> anyhow::Result<RoutingDecisionRow> {
    move |row| {
        let request_tier: i64 = row.try_get("request_tier")?;
        let chosen_tier: i64 = row.try_get("chosen_tier")?;
        let confidence: f64 = row.try_get("confidence")?;
        let complexity: f64 = row.try_get("complexity")?;
        let provider_name: Option<String> = row.try_get("provider_name")?;
        Ok(RoutingDecisionRow {
            run_id,
            node_id: row.try_get::<String, _>("node_id")?,
            agent_id: row.try_get::<String, _>("agent_id")?,
            request_tier: Tier::from_u8(u8::try_from(request_tier).unwrap_or(3)),
            chosen_tier: Tier::from_u8(u8::try_from(chosen_tier).unwrap_or(3)),
            provider_name: provider_name.and_then(|p| ProviderName::try_new(p).ok()),
            reason: row.try_get("reason")?,
            confidence: UnitScore::clamp(confidence),
            complexity: UnitScore::clamp(complexity),
            latency_ms: u64::try_from(row.try_get::<i64, _>("latency_ms")?).unwrap_or(0),
        })
    }
}

/// A routing decision read back from storage, as used by the `tune-router`
/// command.
#[derive(Debug, Clone)]
pub struct RoutingDecisionRow {
    /// The run this decision belongs to.
    pub run_id: RunId,
    /// The node this decision was made for, as stored (not revalidated).
    pub node_id: String,
    /// The agent invoked at this node, as stored.
    pub agent_id: String,
    /// The tier the agent's policy preferred.
    pub request_tier: Tier,
    /// The tier ultimately chosen after escalation.
    pub chosen_tier: Tier,
    /// The provider selected, if any.
    pub provider_name: Option<ProviderName>,
    /// Human-readable escalation rationale.
    pub reason: String,
    /// Confidence signal at decision time.
    pub confidence: UnitScore,
    /// Complexity signal at decision time.
    pub complexity: UnitScore,
    /// Wall-clock latency in milliseconds.
    pub latency_ms: u64,
}

const CREATE_CLAIMS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS claims (
        id TEXT PRIMARY KEY,
        scope_type TEXT NOT NULL,
        scope_id TEXT NOT NULL,
        statement TEXT NOT NULL,
        citations_json TEXT NOT NULL,
        confidence REAL NOT NULL,
        status TEXT NOT NULL,
        supersedes_json TEXT NOT NULL
    )
";

const UPSERT_CLAIM: &str = r"
    INSERT OR REPLACE INTO claims (id, scope_type, scope_id, statement, citations_json, confidence, status, supersedes_json)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
";

const CREATE_SNAPSHOTS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS snapshots (
        id TEXT PRIMARY KEY,
        scope_type TEXT NOT NULL,
        scope_id TEXT NOT NULL,
        claim_ids_json TEXT NOT NULL,
        metric_ids_json TEXT NOT NULL,
        content_hash TEXT NOT NULL,
        taken_at INTEGER NOT NULL
    )
";

const INSERT_SNAPSHOT: &str = r"
    INSERT OR REPLACE INTO snapshots (id, scope_type, scope_id, claim_ids_json, metric_ids_json, content_hash, taken_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
";

const CREATE_DELTAS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS deltas (
        id TEXT PRIMARY KEY,
        from_snapshot TEXT NOT NULL,
        to_snapshot TEXT NOT NULL,
        claim_changes_json TEXT NOT NULL,
        metric_changes_json TEXT NOT NULL
    )
";

const INSERT_DELTA: &str = r"
    INSERT OR REPLACE INTO deltas (id, from_snapshot, to_snapshot, claim_changes_json, metric_changes_json)
    VALUES (?1, ?2, ?3, ?4, ?5)
";

static CONTENT_TABLES_CREATED: Once = Once::new();

/// `SQLite`-backed DAO for claims, snapshots, and deltas (spec §6, §3.1).
pub struct SqliteContentStore {
    connection: DatabaseConnection,
}

impl SqliteContentStore {
    /// Creates a new store over `connection`.
    #[must_use]
    pub fn new(connection: DatabaseConnection) -> Self {
        Self { connection }
    }

    #[instrument(skip(self), err)]
    async fn ensure_schema(&self) -> DatabaseResult<()> {
        CONTENT_TABLES_CREATED.call_once(|| {
            info!("initializing claim/snapshot/delta schema");
        });
        sqlx::query(CREATE_CLAIMS_TABLE).execute(self.connection.pool()).await?;
        sqlx::query(CREATE_SNAPSHOTS_TABLE).execute(self.connection.pool()).await?;
        sqlx::query(CREATE_DELTAS_TABLE).execute(self.connection.pool()).await?;
        Ok(())
    }

    /// Inserts or replaces a claim.
    pub async fn put_claim(&self, claim: &Claim) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        let status = match claim.status {
            ClaimStatus::Active => "active",
            ClaimStatus::Superseded => "superseded",
            ClaimStatus::Retracted => "retracted",
        };
        sqlx::query(UPSERT_CLAIM)
            .bind(claim.id.to_string())
            .bind(scope_type_str(claim.scope_type))
            .bind(claim.scope_id.to_string())
            .bind(&claim.statement)
            .bind(serde_json::to_string(&claim.citations)?)
            .bind(claim.confidence.into_inner())
            .bind(status)
            .bind(serde_json::to_string(&claim.supersedes)?)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    /// Reads a claim by id, if it exists.
    pub async fn get_claim(&self, id: ClaimId) -> anyhow::Result<Option<Claim>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM claims WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        let status: String = row.try_get("status")?;
        let status = match status.as_str() {
            "superseded" => ClaimStatus::Superseded,
            "retracted" => ClaimStatus::Retracted,
            _ => ClaimStatus::Active,
        };
        Ok(Some(Claim {
            id,
            scope_type: scope_type_from_str(&row.try_get::<String, _>("scope_type")?)?,
            scope_id: crate::domain::ScopeId::try_new(row.try_get::<String, _>("scope_id")?)?,
            statement: row.try_get("statement")?,
            citations: serde_json::from_str(&row.try_get::<String, _>("citations_json")?)?,
            confidence: UnitScore::clamp(row.try_get("confidence")?),
            status,
            supersedes: serde_json::from_str(&row.try_get::<String, _>("supersedes_json")?)?,
        }))
    }

    /// Persists a snapshot, recomputing and storing its content hash.
    pub async fn put_snapshot(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        sqlx::query(INSERT_SNAPSHOT)
            .bind(snapshot.id.to_string())
            .bind(scope_type_str(snapshot.scope_type))
            .bind(snapshot.scope_id.to_string())
            .bind(serde_json::to_string(&snapshot.claim_ids)?)
            .bind(serde_json::to_string(&snapshot.metric_ids)?)
            .bind(snapshot.content_hash())
            .bind(snapshot.taken_at.timestamp())
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    /// Reads a snapshot by id, if it exists.
    pub async fn get_snapshot(&self, id: SnapshotId) -> anyhow::Result<Option<Snapshot>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM snapshots WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Snapshot {
            id,
            scope_type: scope_type_from_str(&row.try_get::<String, _>("scope_type")?)?,
            scope_id: crate::domain::ScopeId::try_new(row.try_get::<String, _>("scope_id")?)?,
            claim_ids: serde_json::from_str(&row.try_get::<String, _>("claim_ids_json")?)?,
            metric_ids: serde_json::from_str(&row.try_get::<String, _>("metric_ids_json")?)?,
            taken_at: chrono::DateTime::from_timestamp(row.try_get("taken_at")?, 0)
                .unwrap_or_else(chrono::Utc::now),
        }))
    }

    /// Persists a delta.
    pub async fn put_delta(&self, delta: &Delta) -> anyhow::Result<()> {
        self.ensure_schema().await?;
        sqlx::query(INSERT_DELTA)
            .bind(delta.id.to_string())
            .bind(delta.from_snapshot.to_string())
            .bind(delta.to_snapshot.to_string())
            .bind(serde_json::to_string(&delta.claim_changes)?)
            .bind(serde_json::to_string(&delta.metric_changes)?)
            .execute(self.connection.pool())
            .await?;
        Ok(())
    }

    /// Reads a delta by id, if it exists.
    pub async fn get_delta(&self, id: DeltaId) -> anyhow::Result<Option<Delta>> {
        self.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM deltas WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(self.connection.pool())
            .await?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Delta {
            id,
            from_snapshot: crate::domain::SnapshotId::new(
                uuid::Uuid::parse_str(&row.try_get::<String, _>("from_snapshot")?)?,
            ),
            to_snapshot: crate::domain::SnapshotId::new(
                uuid::Uuid::parse_str(&row.try_get::<String, _>("to_snapshot")?)?,
            ),
            claim_changes: serde_json::from_str(&row.try_get::<String, _>("claim_changes_json")?)?,
            metric_changes: serde_json::from_str(&row.try_get::<String, _>("metric_changes_json")?)?,
        }))
    }
}

fn scope_type_str(scope_type: crate::domain::ScopeType) -> &'static str {
    match scope_type {
        crate::domain::ScopeType::Certification => "certification",
        crate::domain::ScopeType::Topic => "topic",
        crate::domain::ScopeType::Lab => "lab",
        crate::domain::ScopeType::Story => "story",
    }
}

fn scope_type_from_str(value: &str) -> anyhow::Result<crate::domain::ScopeType> {
    Ok(match value {
        "certification" => crate::domain::ScopeType::Certification,
        "topic" => crate::domain::ScopeType::Topic,
        "lab" => crate::domain::ScopeType::Lab,
        "story" => crate::domain::ScopeType::Story,
        other => anyhow::bail!("unknown scope_type in storage: {other}"),
    })
}
