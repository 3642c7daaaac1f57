//! Core domain primitives shared across the routing, dispatch, and orchestration
//! layers.
//!
//! Strongly-typed values prevent primitive obsession (a bare `f64` confidence
//! mixed up with a bare `f64` quality score, a tier `u8` compared against a
//! provider cap `u8`, and so on). Validation happens once, at construction.

use std::fmt;

use chrono::{DateTime, Utc};
use nutype::nutype;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a single graph execution.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display
))]
pub struct RunId(Uuid);

impl RunId {
    /// Generates a fresh random run id.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Name of a node within a `GraphDefinition`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom)
)]
pub struct NodeId(String);

/// Identifier for an agent's policy / agent definition.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom)
)]
pub struct AgentId(String);

/// Name of a registered provider in the `ProviderRegistry`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 128),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom, Ord, PartialOrd)
)]
pub struct ProviderName(String);

/// A concrete model identifier, e.g. `claude-3-5-sonnet` or `llama3.1:8b`.
#[nutype(
    validate(len_char_min = 1, len_char_max = 256),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display, TryFrom)
)]
pub struct ModelId(String);

/// The four escalation tiers: 0 deterministic regex, 1 micro classifier,
/// 2 light reasoner, 3 frontier provider pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Deterministic regex / command dispatch. No model call is made.
    Zero,
    /// Small local classifier model.
    One,
    /// Light local reasoning model.
    Two,
    /// Frontier provider pool, selected via the `ProviderRegistry`.
    Three,
}

impl Tier {
    /// Numeric value matching the spec's `0..=3` tier numbering.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// Constructs a tier from its numeric value, saturating at `Tier::Three`.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Zero,
            1 => Self::One,
            2 => Self::Two,
            _ => Self::Three,
        }
    }

    /// The next tier up, or `Tier::Three` if already at the ceiling.
    #[must_use]
    pub fn escalate(self) -> Self {
        Self::from_u8(self.as_u8().saturating_add(1))
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// A probability-like value in `[0.0, 1.0]`: confidence, quality, complexity,
/// or any other normalized score the routing layer reasons about.
#[nutype(
    validate(finite, greater_or_equal = 0.0, less_or_equal = 1.0),
    derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default)
)]
pub struct UnitScore(f64);

impl UnitScore {
    /// Clamps an arbitrary `f64` into `[0.0, 1.0]` rather than rejecting it.
    ///
    /// Composite scores are themselves sums of weighted `UnitScore`s and can
    /// legitimately land a hair outside the unit range due to floating point
    /// error; clamping keeps the type's invariant without a fallible API at
    /// every call site that computes one.
    #[must_use]
    pub fn clamp(value: f64) -> Self {
        Self::try_new(value.clamp(0.0, 1.0)).unwrap_or_default()
    }
}

/// Count of tokens consumed or produced by a model call.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, Default
))]
pub struct TokenCount(u64);

impl TokenCount {
    /// Adds two token counts.
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self::new(self.into_inner() + other.into_inner())
    }
}

/// A cost in US-cent-equivalent `Decimal` units, never floating point, so
/// thousands of accumulated calls never drift.
#[nutype(derive(
    Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize, Display, Default
))]
pub struct CostCents(Decimal);

impl CostCents {
    /// Zero cost.
    #[must_use]
    pub fn zero() -> Self {
        Self::default()
    }

    /// Computes cost from a token count and a cost-per-1000-tokens rate.
    #[must_use]
    pub fn from_tokens(tokens: TokenCount, per_1k: Decimal) -> Self {
        let cost = Decimal::from(tokens.into_inner()) * per_1k / Decimal::from(1000);
        Self::new(cost)
    }

    /// Adds two costs.
    #[must_use]
    pub fn plus(self, other: Self) -> Self {
        Self::new(self.into_inner() + other.into_inner())
    }
}

/// A UTC timestamp, used for routing decisions, provider failure marks, and
/// checkpoints.
pub type Timestamp = DateTime<Utc>;

/// Size of the SQLite connection pool.
#[nutype(
    validate(greater = 0, less_or_equal = 100),
    derive(
        Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
        Default, TryFrom
    ),
    default = 10
)]
pub struct ConnectionPoolSize(usize);

impl ConnectionPoolSize {
    /// Gets the value as `usize`.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// The reserved run-state keys the router, dispatcher, and orchestrator read
/// or write. Agent-specific output keys are plain strings outside this set.
pub mod reserved_keys {
    /// Set by the orchestrator before invoking each node's agent.
    pub const CURRENT_AGENT_ID: &str = "_current_agent_id";
    /// Last tier-1/2 confidence observed, read by the router's escalation logic.
    pub const LAST_CONFIDENCE: &str = "_last_confidence";
    /// Count of output items missing a citation, an escalation signal.
    pub const MISSING_CITATIONS_COUNT: &str = "_missing_citations_count";
    /// Degree of contradiction/ambiguity detected in upstream claims.
    pub const CONTRADICTION_AMBIGUITY: &str = "_contradiction_ambiguity";
    /// Estimated complexity of the synthesis task at this node.
    pub const SYNTHESIS_COMPLEXITY: &str = "_synthesis_complexity";
    /// Running total of tokens spent by the current run.
    pub const BUDGET_USED_TOKENS: &str = "_budget_used_tokens";
    /// Running total of cost spent by the current run.
    pub const BUDGET_USED_COST: &str = "_budget_used_cost";
    /// Set true once the run crosses 80% of its budget.
    pub const DEGRADATION_ACTIVE: &str = "_degradation_active";

    /// True if `key` is one of the reserved, router/orchestrator-owned keys.
    #[must_use]
    pub fn is_reserved(key: &str) -> bool {
        key.starts_with('_')
    }
}
