//! Tiered Dispatcher: the request-facing tier-0..3 escalation chain. Safety
//! bypass, sanitization, per-tier semaphores and timeouts, tier-1
//! classification, tier-2 reasoning, and tier-3 provider fallback.

pub mod sanitize;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};

use crate::adapters::{ModelAdapter, ModelApiError};
use crate::command_registry::{CommandMatch, CommandRegistry};
use crate::config::RouterConfig;
use crate::domain::{CostCents, ProviderName, Tier, TokenCount, UnitScore};
use crate::providers::{ProviderRegistry, SelectionRequirements};
use sanitize::{SanitizeOutcome, sanitize};

/// Result of a tier-1 classification call.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationResult {
    /// The tier the classifier recommends handling this request at.
    #[serde(default = "default_tier1")]
    pub recommended_tier: u8,
    /// Classifier confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Whether the classifier flagged this input as unsafe.
    #[serde(default)]
    pub safety_flag: bool,
    /// Human-readable reason when `safety_flag` is set.
    #[serde(default)]
    pub safety_reason: Option<String>,
    /// Whether the classifier itself recommends escalating past tier 1.
    #[serde(default)]
    pub escalate: bool,
}

fn default_tier1() -> u8 {
    1
}

/// Result of a tier-2 reasoning call.
#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningResult {
    /// Self-assessed quality of the tier-2 response, in `[0.0, 1.0]`.
    pub quality_score: f64,
    /// Whether tier 2 itself recommends escalating to tier 3.
    #[serde(default)]
    pub escalate: bool,
    /// Whether this request required reasoning depth beyond tier 2's remit.
    #[serde(default)]
    pub deep_reasoning: bool,
    /// The tier-2 response body.
    #[serde(default)]
    pub content: String,
}

/// Result of a successful tier-3 provider call.
#[derive(Debug, Clone)]
pub struct ProviderCallResult {
    /// Which provider ultimately served the call.
    pub provider_name: ProviderName,
    /// The provider's raw response text.
    pub content: String,
    /// Input tokens billed.
    pub input_tokens: TokenCount,
    /// Output tokens billed.
    pub output_tokens: TokenCount,
    /// Estimated cost of the call.
    pub cost: CostCents,
}

/// The outcome of dispatching one request through the tier chain.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    /// Tier 0 resolved to a deterministic command.
    Tier0(CommandMatch),
    /// Tier 1 classification was accepted as final.
    Tier1(ClassificationResult),
    /// Tier 2 reasoning was accepted as final.
    Tier2(ReasoningResult),
    /// Tier 3 produced a response via a frontier provider.
    Tier3(ProviderCallResult),
    /// The request was rejected (oversized, or a suspected injection, or a
    /// tier-1 safety flag). Never escalates further.
    Rejected {
        /// Why the request was rejected.
        reason: String,
    },
}

/// Fatal dispatch failures — everything else is a `DispatchOutcome` variant.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every tier-3 provider candidate was exhausted without success.
    #[error("routing failure at tier {tier}: tried {tried:?}")]
    RoutingFailure {
        /// The tier at which every candidate failed (always `Tier::Three`).
        tier: Tier,
        /// Providers tried, in attempt order.
        tried: Vec<ProviderName>,
    },
}

struct TierAdapters {
    tier1: Arc<dyn ModelAdapter>,
    tier2: Arc<dyn ModelAdapter>,
}

/// Dispatches free-text and JSON-command requests through the tier-0..3
/// chain described in spec §4.5.
pub struct TieredDispatcher {
    config: Arc<RwLock<RouterConfig>>,
    commands: CommandRegistry,
    adapters: TierAdapters,
    providers: ProviderRegistry,
    tier1_semaphore: RwLock<Arc<Semaphore>>,
    tier2_semaphore: RwLock<Arc<Semaphore>>,
    max_input_len: usize,
}

const DEFAULT_MAX_INPUT_LEN: usize = 32_768;

impl TieredDispatcher {
    /// Builds a dispatcher with the default command set.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        tier1_adapter: Arc<dyn ModelAdapter>,
        tier2_adapter: Arc<dyn ModelAdapter>,
        providers: ProviderRegistry,
    ) -> Self {
        let tier1_permits = config.tier1.concurrency;
        let tier2_permits = config.tier2.concurrency;
        Self {
            config: Arc::new(RwLock::new(config)),
            commands: CommandRegistry::with_default_commands(),
            adapters: TierAdapters {
                tier1: tier1_adapter,
                tier2: tier2_adapter,
            },
            providers,
            tier1_semaphore: RwLock::new(Arc::new(Semaphore::new(tier1_permits))),
            tier2_semaphore: RwLock::new(Arc::new(Semaphore::new(tier2_permits))),
            max_input_len: DEFAULT_MAX_INPUT_LEN,
        }
    }

    /// Re-reads thresholds, timeouts, and semaphore permits from `path`,
    /// swapping them in atomically without replacing adapters or the
    /// provider registry.
    pub async fn reload_config(
        &self,
        path: &std::path::Path,
    ) -> Result<(), crate::config::RouterConfigError> {
        let fresh = RouterConfig::load(path)?;
        let new_tier1 = Arc::new(Semaphore::new(fresh.tier1.concurrency));
        let new_tier2 = Arc::new(Semaphore::new(fresh.tier2.concurrency));
        {
            let mut guard = self.config.write().await;
            *guard = fresh;
        }
        *self.tier1_semaphore.write().await = new_tier1;
        *self.tier2_semaphore.write().await = new_tier2;
        Ok(())
    }

    /// Runs `input` through the tier-0..3 escalation chain.
    pub async fn dispatch(&self, input: &str) -> Result<DispatchOutcome, DispatchError> {
        match sanitize(input, self.max_input_len) {
            SanitizeOutcome::TooLong { max, actual } => {
                return Ok(DispatchOutcome::Rejected {
                    reason: format!("input too long: {actual} bytes exceeds max {max}"),
                });
            }
            SanitizeOutcome::InjectionSuspected { pattern } => {
                return Ok(DispatchOutcome::Rejected {
                    reason: format!("suspected prompt injection: {pattern}"),
                });
            }
            SanitizeOutcome::Clean => {}
        }

        if let Some(command) = self.commands.match_input(input) {
            return Ok(DispatchOutcome::Tier0(command));
        }

        self.dispatch_tier1(input).await
    }

    async fn dispatch_tier1(&self, input: &str) -> Result<DispatchOutcome, DispatchError> {
        let config = self.config.read().await.clone();

        let semaphore = self.tier1_semaphore.read().await.clone();
        let Ok(permit) = tokio::time::timeout(Duration::from_millis(50), semaphore.acquire_owned()).await
        else {
            return self.dispatch_tier2(input).await;
        };
        let Ok(permit) = permit else {
            return self.dispatch_tier2(input).await;
        };

        let first = Self::call_tier1(&self.adapters.tier1, input, config.tier1.timeout).await;
        let result = match first {
            Ok(r) => Some(r),
            // §4.5.1: a failed tier-1 call retries exactly once, as a fresh
            // classification that discards whatever the first attempt saw.
            Err(_) => {
                match Self::call_tier1(&self.adapters.tier1, input, config.tier1.timeout).await {
                    Ok(r) => Some(r),
                    Err(_) => None,
                }
            }
        };
        drop(permit);

        let Some(r1) = result else {
            return self.dispatch_tier2(input).await;
        };

        if r1.safety_flag {
            let reason = r1
                .safety_reason
                .clone()
                .unwrap_or_else(|| "flagged unsafe by tier-1 classifier".to_string());
            return Ok(DispatchOutcome::Rejected { reason });
        }

        let composite_escalate = self.composite_escalate(&config, &r1).await;
        if r1.recommended_tier <= 1
            && r1.confidence >= f64::from(config.escalation.confidence_threshold)
            && !r1.escalate
            && !composite_escalate
        {
            return Ok(DispatchOutcome::Tier1(r1));
        }

        self.dispatch_tier2(input).await
    }

    async fn composite_escalate(&self, config: &RouterConfig, r1: &ClassificationResult) -> bool {
        let confidence = UnitScore::clamp(r1.confidence);
        let weights = config.escalation.weights;
        let score = f64::from(weights.confidence) * (1.0 - confidence.into_inner());
        score > f64::from(config.escalation.composite_threshold)
    }

    async fn call_tier1(
        adapter: &Arc<dyn ModelAdapter>,
        input: &str,
        timeout: Duration,
    ) -> Result<ClassificationResult, ModelApiError> {
        let system = "Classify the request. Reply with a single JSON object: \
            {\"recommended_tier\":1,\"confidence\":0.0-1.0,\"safety_flag\":bool,\"escalate\":bool}.";
        let call = adapter.call(system, input, 256, 0.0);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(outcome)) => extract_json(&outcome.content)
                .ok_or_else(|| ModelApiError::permanent("tier-1 response was not valid JSON")),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ModelApiError::retryable("tier-1 classification timed out")),
        }
    }

    async fn dispatch_tier2(&self, input: &str) -> Result<DispatchOutcome, DispatchError> {
        let config = self.config.read().await.clone();

        let semaphore = self.tier2_semaphore.read().await.clone();
        let permit = tokio::time::timeout(Duration::from_millis(50), semaphore.acquire_owned()).await;

        if let Ok(Ok(permit)) = permit {
            let system = "Reason carefully about the request. Reply with a single JSON object: \
                {\"quality_score\":0.0-1.0,\"escalate\":bool,\"deep_reasoning\":bool,\"content\":\"...\"}.";
            let call = self.adapters.tier2.call(system, input, 1024, 0.2);
            let outcome = tokio::time::timeout(config.tier2.timeout, call).await;
            drop(permit);

            if let Ok(Ok(outcome)) = outcome {
                if let Some(r2) = extract_json::<ReasoningResult>(&outcome.content) {
                    if r2.quality_score >= f64::from(config.escalation.quality_threshold)
                        && !r2.escalate
                        && !r2.deep_reasoning
                    {
                        return Ok(DispatchOutcome::Tier2(r2));
                    }
                }
            }
        }

        self.dispatch_tier3(input).await
    }

    async fn dispatch_tier3(&self, input: &str) -> Result<DispatchOutcome, DispatchError> {
        let config = self.config.read().await.clone();
        let requirements = SelectionRequirements::default();

        let mut tried: HashSet<ProviderName> = HashSet::new();
        loop {
            let Some(entry) = self
                .providers
                .select_with_fallback(&requirements, config.selection_strategy, &tried)
            else {
                return Err(DispatchError::RoutingFailure {
                    tier: Tier::Three,
                    tried: tried.into_iter().collect(),
                });
            };

            if self.providers.is_cap_exceeded(&entry.name) {
                tried.insert(entry.name);
                continue;
            }

            let timeout = config.tier2.timeout.max(Duration::from_secs(30));
            match tokio::time::timeout(timeout, entry.adapter.call("", input, 2048, 0.2)).await {
                Ok(Ok(outcome)) => {
                    self.providers.record_call(&entry.name);
                    let cost = entry.estimate_cost(outcome.input_tokens, outcome.output_tokens);
                    return Ok(DispatchOutcome::Tier3(ProviderCallResult {
                        provider_name: entry.name,
                        content: outcome.content,
                        input_tokens: outcome.input_tokens,
                        output_tokens: outcome.output_tokens,
                        cost,
                    }));
                }
                Ok(Err(e)) if e.retryable => {
                    self.providers.mark_unavailable(&entry.name);
                    tried.insert(entry.name);
                }
                Ok(Err(_)) | Err(_) => {
                    tried.insert(entry.name);
                }
            }
        }
    }
}

fn extract_json<T: for<'de> Deserialize<'de>>(content: &str) -> Option<T> {
    let trimmed = content.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let stripped = stripped.strip_suffix("```").unwrap_or(stripped).trim();

    let start = stripped.find(['{', '['])?;
    let end = stripped.rfind(['}', ']'])?;
    if end < start {
        return None;
    }
    serde_json::from_str(&stripped[start..=end]).ok()
}
