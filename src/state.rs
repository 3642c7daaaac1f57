//! Run State: the open, JSON-valued key→value mapping that accumulates as a
//! graph run walks its nodes. Owned exclusively by the orchestrator for the
//! lifetime of one run; the router and dispatcher only read from it.

use std::collections::HashMap;

use serde_json::Value;

use crate::domain::reserved_keys;
use crate::domain::{AgentId, CostCents, TokenCount, UnitScore};

/// The mutable state threaded through a single graph run.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    values: HashMap<String, Value>,
}

impl RunState {
    /// Builds an empty run state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a run state pre-populated with the given key/value pairs,
    /// e.g. the seed arguments supplied by a tier-0 command match.
    #[must_use]
    pub fn seeded(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    /// True if `key` exists in the state, regardless of value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Raw value lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Sets a raw value, overwriting any prior value at `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Merges a node's delta output into this state. Only keys declared as
    /// that node's `produced_outputs` should be passed here; the caller
    /// (the orchestrator) enforces that invariant.
    pub fn merge(&mut self, delta: HashMap<String, Value>) {
        self.values.extend(delta);
    }

    /// A snapshot of every key currently present, for checkpointing.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.values.clone()
    }

    /// Restores a full state from a checkpointed snapshot.
    #[must_use]
    pub fn from_snapshot(values: HashMap<String, Value>) -> Self {
        Self { values }
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    /// `_last_confidence`, defaulting to a neutral `1.0` (no evidence of low
    /// confidence) when the key is absent, e.g. before the first LLM node.
    #[must_use]
    pub fn last_confidence(&self) -> UnitScore {
        self.get_f64(reserved_keys::LAST_CONFIDENCE)
            .map_or_else(|| UnitScore::clamp(1.0), UnitScore::clamp)
    }

    /// `_missing_citations_count`, defaulting to zero.
    #[must_use]
    pub fn missing_citations_count(&self) -> u64 {
        self.values
            .get(reserved_keys::MISSING_CITATIONS_COUNT)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    /// `_contradiction_ambiguity`, defaulting to zero (no contradictions
    /// observed).
    #[must_use]
    pub fn contradiction_ambiguity(&self) -> UnitScore {
        self.get_f64(reserved_keys::CONTRADICTION_AMBIGUITY)
            .map_or_else(UnitScore::default, UnitScore::clamp)
    }

    /// `_synthesis_complexity`, defaulting to zero.
    #[must_use]
    pub fn synthesis_complexity(&self) -> UnitScore {
        self.get_f64(reserved_keys::SYNTHESIS_COMPLEXITY)
            .map_or_else(UnitScore::default, UnitScore::clamp)
    }

    /// `_budget_used_tokens`, defaulting to zero.
    #[must_use]
    pub fn budget_used_tokens(&self) -> TokenCount {
        self.values
            .get(reserved_keys::BUDGET_USED_TOKENS)
            .and_then(Value::as_u64)
            .map_or_else(TokenCount::default, TokenCount::new)
    }

    /// `_budget_used_cost`, defaulting to zero.
    #[must_use]
    pub fn budget_used_cost(&self) -> CostCents {
        self.values
            .get(reserved_keys::BUDGET_USED_COST)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .map_or_else(CostCents::zero, CostCents::new)
    }

    /// `_degradation_active`, defaulting to `false`.
    #[must_use]
    pub fn degradation_active(&self) -> bool {
        self.values
            .get(reserved_keys::DEGRADATION_ACTIVE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Sets `_current_agent_id`, the only reserved key the orchestrator
    /// writes directly rather than through a node's declared outputs.
    pub fn set_current_agent_id(&mut self, agent_id: &AgentId) {
        self.set(
            reserved_keys::CURRENT_AGENT_ID,
            Value::String(agent_id.to_string()),
        );
    }

    /// Updates the running budget totals and, once `used/cap >= 0.8`, sets
    /// `_degradation_active`.
    pub fn record_budget_usage(
        &mut self,
        used_tokens: TokenCount,
        used_cost: CostCents,
        run_token_cap: Option<u64>,
    ) {
        self.set(
            reserved_keys::BUDGET_USED_TOKENS,
            Value::from(used_tokens.into_inner()),
        );
        self.set(
            reserved_keys::BUDGET_USED_COST,
            Value::String(used_cost.into_inner().to_string()),
        );
        if let Some(cap) = run_token_cap {
            if cap > 0 {
                let ratio = used_tokens.into_inner() as f64 / cap as f64;
                if ratio >= 0.8 {
                    self.set(reserved_keys::DEGRADATION_ACTIVE, Value::Bool(true));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_signals_default_to_neutral_values() {
        let state = RunState::new();
        assert!((state.last_confidence().into_inner() - 1.0).abs() < f64::EPSILON);
        assert_eq!(state.missing_citations_count(), 0);
        assert!(!state.degradation_active());
    }

    #[test]
    fn merge_adds_declared_outputs_without_touching_others() {
        let mut state = RunState::new();
        state.set("summary", Value::String("hello".to_string()));
        let mut delta = HashMap::new();
        delta.insert("claims".to_string(), Value::from(3));
        state.merge(delta);
        assert_eq!(state.get("summary").unwrap().as_str(), Some("hello"));
        assert_eq!(state.get("claims").unwrap().as_u64(), Some(3));
    }

    #[test]
    fn budget_usage_sets_degradation_at_eighty_percent() {
        let mut state = RunState::new();
        state.record_budget_usage(TokenCount::new(800), CostCents::zero(), Some(1000));
        assert!(state.degradation_active());
    }

    #[test]
    fn budget_usage_below_threshold_leaves_degradation_unset() {
        let mut state = RunState::new();
        state.record_budget_usage(TokenCount::new(100), CostCents::zero(), Some(1000));
        assert!(!state.degradation_active());
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let mut state = RunState::new();
        state.set("a", Value::from(1));
        let snapshot = state.snapshot();
        let restored = RunState::from_snapshot(snapshot);
        assert_eq!(restored.get("a").unwrap().as_u64(), Some(1));
    }
}
