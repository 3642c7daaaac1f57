//! Model Router: maps an agent policy and the current run state to a chosen
//! tier/provider, and supplies the orchestrator a concrete call closure.
//!
//! Distinct from the [`crate::dispatcher`] (which routes *incoming requests*
//! through tiers 0-3): the router decides, *per graph node*, which tier's
//! model serves that node's LLM agent, escalating on composite-score
//! signals accumulated in run state rather than on a live classifier call.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::adapters::{ModelAdapter, ModelApiError, ModelCallOutcome};
use crate::config::{RouterConfig, RouterConfigError};
use crate::domain::{ModelId, ProviderName, Tier, TokenCount, UnitScore};
use crate::providers::{ProviderRegistry, SelectionRequirements};
use crate::state::RunState;

/// Immutable per-agent routing policy (§3 Data Model).
#[derive(Debug, Clone)]
pub struct AgentPolicy {
    /// Tier the agent prefers absent any escalation signal.
    pub preferred_tier: Tier,
    /// Floor tier below which routing decisions may never fall.
    pub min_tier: Tier,
    /// Ceiling on output tokens for this agent's calls, applied on top of
    /// whichever tier's own `max_output_tokens` is smaller.
    pub max_output_tokens: u32,
    /// Local model identifiers this agent is permitted to use.
    pub permitted_local_models: Vec<ModelId>,
    /// Frontier model identifiers this agent is permitted to use.
    pub permitted_frontier_models: Vec<ModelId>,
    /// Minimum confidence below which the router escalates.
    pub confidence_threshold: UnitScore,
    /// Whether the agent's output validator requires non-empty citations.
    pub required_citations: bool,
}

impl AgentPolicy {
    /// A deterministic (tier-0) agent policy: no model is ever called.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            preferred_tier: Tier::Zero,
            min_tier: Tier::Zero,
            max_output_tokens: 0,
            permitted_local_models: Vec::new(),
            permitted_frontier_models: Vec::new(),
            confidence_threshold: UnitScore::clamp(1.0),
            required_citations: false,
        }
    }
}

/// The tier/provider decision for one node, before execution metrics
/// (latency, tokens, cost) are known.
#[derive(Debug, Clone)]
pub struct TierSelection {
    /// Tier the request entered at (the agent's preferred tier).
    pub request_tier: Tier,
    /// Tier ultimately chosen after escalation.
    pub chosen_tier: Tier,
    /// Display name of the adapter or provider that will serve the call.
    pub adapter_name: String,
    /// Provider name, present only when `chosen_tier == Tier::Three`.
    pub provider_name: Option<ProviderName>,
    /// Human-readable escalation rationale.
    pub reason: String,
    /// Confidence signal used in the decision.
    pub confidence: UnitScore,
    /// Complexity signal used in the decision.
    pub complexity: UnitScore,
    /// The composite routing score computed for this decision.
    pub composite_score: UnitScore,
}

/// A callable closure over the adapter chosen for a [`TierSelection`].
pub struct RouterCallable {
    adapter: Arc<dyn ModelAdapter>,
    max_output_tokens: u32,
    temperature: f32,
}

impl RouterCallable {
    /// Invokes the underlying adapter with this selection's sampling
    /// parameters.
    pub async fn call(
        &self,
        system: &str,
        user: &str,
    ) -> Result<ModelCallOutcome, ModelApiError> {
        self.adapter
            .call(system, user, self.max_output_tokens, self.temperature)
            .await
    }

    /// The adapter's display name.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }
}

#[async_trait]
impl crate::agent::ModelCallable for RouterCallable {
    async fn call(&self, system: &str, user: &str) -> Result<ModelCallOutcome, ModelApiError> {
        RouterCallable::call(self, system, user).await
    }
}

/// Derives the hallucination-risk signal from contradiction/ambiguity and
/// missing-citation counts (§4.4.1): a pure function of the four documented
/// reserved keys, introducing no fifth one.
#[must_use]
fn hallucination_risk(contradiction_ambiguity: UnitScore, missing_citations_count: u64) -> UnitScore {
    let citation_component = (missing_citations_count as f64 / 3.0).min(1.0);
    UnitScore::clamp(0.5 * contradiction_ambiguity.into_inner() + 0.5 * citation_component)
}

/// Computes the composite routing score:
/// `complexity*w1 + (1-confidence)*w2 + hallucination_risk*w3`.
#[must_use]
fn composite_score(
    complexity: UnitScore,
    confidence: UnitScore,
    hallucination: UnitScore,
    weights: crate::config::ScoreWeights,
) -> UnitScore {
    let score = f64::from(weights.complexity) * complexity.into_inner()
        + f64::from(weights.confidence) * (1.0 - confidence.into_inner())
        + f64::from(weights.hallucination) * hallucination.into_inner();
    UnitScore::clamp(score)
}

/// Maps agent policies and run-state signals to tier/provider decisions.
pub struct ModelRouter {
    config: Arc<RwLock<RouterConfig>>,
    tier1_adapter: Arc<dyn ModelAdapter>,
    tier2_adapter: Arc<dyn ModelAdapter>,
    providers: ProviderRegistry,
    reload_generation: AtomicU32,
}

impl ModelRouter {
    /// Builds a router over the given config and adapters. The tier-1/tier-2
    /// adapters and the provider registry are fixed for the router's
    /// lifetime; only thresholds/timeouts/tier-config values are swapped by
    /// [`Self::reload_config`].
    #[must_use]
    pub fn new(
        config: RouterConfig,
        tier1_adapter: Arc<dyn ModelAdapter>,
        tier2_adapter: Arc<dyn ModelAdapter>,
        providers: ProviderRegistry,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            tier1_adapter,
            tier2_adapter,
            providers,
            reload_generation: AtomicU32::new(0),
        }
    }

    /// Re-reads thresholds and tier configs from `path`, swapping them in
    /// atomically without replacing the tier-1/tier-2 adapters or the
    /// provider registry.
    pub async fn reload_config(&self, path: &std::path::Path) -> Result<(), RouterConfigError> {
        let fresh = RouterConfig::load(path)?;
        let mut guard = self.config.write().await;
        *guard = fresh;
        self.reload_generation.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of times [`Self::reload_config`] has succeeded, for
    /// diagnostics.
    #[must_use]
    pub fn reload_generation(&self) -> u32 {
        self.reload_generation.load(Ordering::Relaxed)
    }

    /// Selects a tier and (for tier 3) a provider for one node's call.
    pub async fn select_model(&self, policy: &AgentPolicy, state: &RunState) -> TierSelection {
        if policy.preferred_tier == Tier::Zero {
            return TierSelection {
                request_tier: Tier::Zero,
                chosen_tier: Tier::Zero,
                adapter_name: "none".to_string(),
                provider_name: None,
                reason: "agent is deterministic; no model call".to_string(),
                confidence: UnitScore::clamp(1.0),
                complexity: UnitScore::default(),
                composite_score: UnitScore::default(),
            };
        }

        let config = self.config.read().await;
        let confidence = state.last_confidence();
        let complexity = state.synthesis_complexity();
        let contradiction = state.contradiction_ambiguity();
        let missing_citations = state.missing_citations_count();
        let risk = hallucination_risk(contradiction, missing_citations);
        let composite = composite_score(complexity, confidence, risk, config.escalation.weights);

        let confidence_breach = confidence.into_inner() < f64::from(config.escalation.confidence_threshold);
        let complexity_breach = complexity.into_inner() > f64::from(config.escalation.complexity_threshold);
        let composite_breach = composite.into_inner() > f64::from(config.escalation.composite_threshold);

        let (tier, reason) = if confidence_breach || complexity_breach || composite_breach {
            let escalated = policy.preferred_tier.escalate();
            (
                escalated,
                format!(
                    "escalated from tier {} to tier {escalated}: composite score {:.3} (confidence={:.2}, complexity={:.2}, hallucination_risk={:.2})",
                    policy.preferred_tier, composite.into_inner(), confidence.into_inner(), complexity.into_inner(),
                ),
            )
        } else {
            (
                policy.preferred_tier,
                format!(
                    "stayed at preferred tier {}: composite score {:.3} within threshold",
                    policy.preferred_tier, composite.into_inner(),
                ),
            )
        };

        let tier = std::cmp::max(tier, policy.min_tier);

        match tier {
            Tier::Zero | Tier::One => TierSelection {
                request_tier: policy.preferred_tier,
                chosen_tier: Tier::One,
                adapter_name: "tier1".to_string(),
                provider_name: None,
                reason,
                confidence,
                complexity,
                composite_score: composite,
            },
            Tier::Two => TierSelection {
                request_tier: policy.preferred_tier,
                chosen_tier: Tier::Two,
                adapter_name: "tier2".to_string(),
                provider_name: None,
                reason,
                confidence,
                complexity,
                composite_score: composite,
            },
            Tier::Three => {
                let requirements = SelectionRequirements {
                    min_quality: UnitScore::clamp(f64::from(config.escalation.quality_threshold)),
                    max_cost_per_1k: None,
                    min_context: 0,
                    required_tags: vec!["frontier".to_string()],
                };
                let provider = self
                    .providers
                    .select(&requirements, config.selection_strategy)
                    .or_else(|| {
                        self.providers.select(
                            &SelectionRequirements::default(),
                            config.selection_strategy,
                        )
                    });
                match provider {
                    Some(entry) => TierSelection {
                        request_tier: policy.preferred_tier,
                        chosen_tier: Tier::Three,
                        adapter_name: entry.name.to_string(),
                        provider_name: Some(entry.name),
                        reason,
                        confidence,
                        complexity,
                        composite_score: composite,
                    },
                    None => TierSelection {
                        request_tier: policy.preferred_tier,
                        chosen_tier: Tier::Three,
                        adapter_name: "none".to_string(),
                        provider_name: None,
                        reason: format!("{reason}; no qualifying tier-3 provider available"),
                        confidence,
                        complexity,
                        composite_score: composite,
                    },
                }
            }
        }
    }

    /// Returns a closure over the concrete adapter selected by `decision`,
    /// or `None` for a deterministic (tier-0) decision or an unsatisfiable
    /// tier-3 selection.
    pub async fn get_callable(&self, decision: &TierSelection) -> Option<RouterCallable> {
        let config = self.config.read().await;
        match decision.chosen_tier {
            Tier::Zero => None,
            Tier::One => Some(RouterCallable {
                adapter: self.tier1_adapter.clone(),
                max_output_tokens: config.tier1.max_output_tokens,
                temperature: config.tier1.temperature,
            }),
            Tier::Two => Some(RouterCallable {
                adapter: self.tier2_adapter.clone(),
                max_output_tokens: config.tier2.max_output_tokens,
                temperature: config.tier2.temperature,
            }),
            Tier::Three => {
                let name = decision.provider_name.as_ref()?;
                let entry = self.providers.get(name)?;
                Some(RouterCallable {
                    adapter: entry.adapter,
                    max_output_tokens: 4096,
                    temperature: 0.2,
                })
            }
        }
    }

    /// Read-through access to the provider registry, used by the
    /// dispatcher's tier-3 fallback loop.
    #[must_use]
    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ModelApiError as Err2, ModelCallOutcome as Outcome2};
    use crate::time_provider::test_time_provider;
    use async_trait::async_trait;
    use serde_json::Value;

    struct StubAdapter(&'static str);

    #[async_trait]
    impl ModelAdapter for StubAdapter {
        fn name(&self) -> &str {
            self.0
        }
        async fn call(
            &self,
            _system: &str,
            _user: &str,
            _max_output_tokens: u32,
            _temperature: f32,
        ) -> Result<Outcome2, Err2> {
            Ok(Outcome2 {
                content: "{}".to_string(),
                input_tokens: TokenCount::new(1),
                output_tokens: TokenCount::new(1),
            })
        }
        fn input_tokens_total(&self) -> u64 {
            0
        }
        fn output_tokens_total(&self) -> u64 {
            0
        }
        fn call_count(&self) -> u64 {
            0
        }
    }

    fn router() -> ModelRouter {
        ModelRouter::new(
            RouterConfig::development(),
            Arc::new(StubAdapter("tier1")),
            Arc::new(StubAdapter("tier2")),
            ProviderRegistry::new(None, test_time_provider()),
        )
    }

    fn policy(preferred: Tier, min: Tier) -> AgentPolicy {
        AgentPolicy {
            preferred_tier: preferred,
            min_tier: min,
            max_output_tokens: 1024,
            permitted_local_models: Vec::new(),
            permitted_frontier_models: Vec::new(),
            confidence_threshold: UnitScore::clamp(0.6),
            required_citations: false,
        }
    }

    #[tokio::test]
    async fn tier_zero_policy_short_circuits_without_model_call() {
        let router = router();
        let state = RunState::new();
        let decision = router.select_model(&policy(Tier::Zero, Tier::Zero), &state).await;
        assert_eq!(decision.chosen_tier, Tier::Zero);
        assert!(router.get_callable(&decision).await.is_none());
    }

    #[tokio::test]
    async fn composite_score_escalation_matches_spec_scenario() {
        let router = router();
        let mut state = RunState::new();
        state.set("_last_confidence", Value::from(0.5));
        state.set("_synthesis_complexity", Value::from(0.9));
        state.set("_missing_citations_count", Value::from(3));

        let decision = router.select_model(&policy(Tier::One, Tier::Zero), &state).await;
        assert_eq!(decision.chosen_tier, Tier::Two);
        assert!(decision.reason.contains("composite score"));
    }

    #[tokio::test]
    async fn tier_floor_is_never_violated() {
        let router = router();
        let state = RunState::new();
        let decision = router.select_model(&policy(Tier::One, Tier::Two), &state).await;
        assert!(decision.chosen_tier >= Tier::Two);
    }

    #[tokio::test]
    async fn high_confidence_stays_at_preferred_tier() {
        let router = router();
        let mut state = RunState::new();
        state.set("_last_confidence", Value::from(0.95));
        let decision = router.select_model(&policy(Tier::One, Tier::Zero), &state).await;
        assert_eq!(decision.chosen_tier, Tier::One);
        let callable = router.get_callable(&decision).await.expect("tier1 callable");
        assert_eq!(callable.adapter_name(), "tier1");
    }

    #[tokio::test]
    async fn tier_three_selects_a_provider_when_available() {
        let router = router();
        router.providers().register(crate::providers::ProviderEntry {
            name: ProviderName::try_new("cloud-a").unwrap(),
            adapter: Arc::new(StubAdapter("cloud-a")),
            input_cost_per_1k: rust_decimal::Decimal::ZERO,
            output_cost_per_1k: rust_decimal::Decimal::ZERO,
            quality: UnitScore::clamp(0.9),
            max_context: 100_000,
            tags: ["frontier".to_string()].into_iter().collect(),
            daily_cap: None,
        });
        let mut state = RunState::new();
        state.set("_last_confidence", Value::from(0.1));
        state.set("_synthesis_complexity", Value::from(0.95));
        let decision = router
            .select_model(&policy(Tier::Two, Tier::Zero), &state)
            .await;
        assert_eq!(decision.chosen_tier, Tier::Three);
        assert_eq!(decision.provider_name.unwrap().to_string(), "cloud-a");
    }
}
