//! Router configuration: per-tier model settings, escalation criteria,
//! provider specs, and the composite-score weights that drive escalation.
//!
//! Mirrors the teacher's `message_router::config::RouterConfig` shape: a
//! plain data struct with `development()`/`production()` presets and a
//! `validate()` pass, loaded from YAML and swapped atomically via
//! `reload_config`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::load_yaml;
use crate::domain::{ModelId, ProviderName};

/// Per-tier model settings for tiers 1 and 2 (tier 0 is regex-only, tier 3 is
/// the provider pool below).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Model identifier served by the local adapter for this tier.
    pub model: ModelId,
    /// Maximum input context length, in tokens.
    pub context_length: u32,
    /// Maximum number of tokens the model may generate.
    pub max_output_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-call timeout.
    #[serde(with = "humantime_seconds")]
    pub timeout: Duration,
    /// Number of concurrent in-flight calls permitted for this tier.
    pub concurrency: usize,
}

/// A tier-3 frontier provider entry as declared in config, before it is
/// registered with a live adapter in the `ProviderRegistry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Unique provider name, used in routing decisions and telemetry.
    pub name: ProviderName,
    /// Hostname or base URL of the provider's API.
    pub host: String,
    /// Model identifier to request from this provider.
    pub model: ModelId,
    /// Cost in cents per 1000 input tokens.
    pub input_cost_per_1k: rust_decimal::Decimal,
    /// Cost in cents per 1000 output tokens.
    pub output_cost_per_1k: rust_decimal::Decimal,
    /// Provider's self-reported or benchmarked quality score, `[0.0, 1.0]`.
    pub quality: f32,
    /// Maximum input context length this provider accepts.
    pub max_context: u32,
    /// Free-form tags (`local`, `dgx`, `cloud`, `frontier`, ...).
    #[serde(default)]
    pub tags: Vec<String>,
    /// Maximum calls to this provider per local day, `None` for unlimited.
    #[serde(default)]
    pub daily_cap: Option<u64>,
}

/// Thresholds that decide whether a node escalates past its agent's
/// preferred tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationCriteria {
    /// Minimum confidence below which the node escalates.
    pub confidence_threshold: f32,
    /// Maximum tolerated complexity before escalating.
    pub complexity_threshold: f32,
    /// Minimum quality below which the node escalates.
    pub quality_threshold: f32,
    /// Maximum tolerated reasoning depth before escalating.
    pub reasoning_depth_threshold: f32,
    /// Weights applied to the composite routing score.
    pub weights: ScoreWeights,
    /// Composite-score value above which escalation is forced regardless of
    /// the individual thresholds.
    pub composite_threshold: f32,
}

/// Weights for the composite routing score:
/// `complexity*w_complexity + (1-confidence)*w_confidence + hallucination_risk*w_hallucination`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Weight applied to task complexity.
    pub complexity: f32,
    /// Weight applied to `1 - confidence`.
    pub confidence: f32,
    /// Weight applied to the derived hallucination risk signal.
    pub hallucination: f32,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            complexity: 0.4,
            confidence: 0.3,
            hallucination: 0.3,
        }
    }
}

/// Strategy used by the `ProviderRegistry` to pick among qualifying tier-3
/// providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// Ascending by output cost.
    CheapestQualified,
    /// Descending by quality score.
    HighestQuality,
    /// `local`/`dgx`-tagged providers first (by quality), then others.
    PreferLocal,
}

/// Top-level router configuration, loaded from a single YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Tier-1 (micro classifier) settings.
    pub tier1: TierConfig,
    /// Tier-2 (light reasoner) settings.
    pub tier2: TierConfig,
    /// Tier-3 frontier provider pool.
    pub providers: Vec<ProviderSpec>,
    /// Escalation thresholds and composite-score weights.
    pub escalation: EscalationCriteria,
    /// Strategy used when selecting among tier-3 providers.
    pub selection_strategy: SelectionStrategy,
    /// Aggregate daily cap across all tier-3 providers, `None` for unlimited.
    #[serde(default)]
    pub daily_aggregate_cap: Option<u64>,
    /// Default per-run node visit cap before `GraphError::CycleLimitExceeded`.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
}

fn default_max_node_visits() -> u32 {
    8
}

/// Errors raised while validating a loaded `RouterConfig`.
#[derive(Debug, Error)]
pub enum RouterConfigError {
    /// The config file could not be loaded or parsed.
    #[error(transparent)]
    Load(#[from] super::ConfigLoadError),
    /// A tier declared zero concurrency, which would deadlock every call.
    #[error("{tier} concurrency must be at least 1, got {actual}")]
    ZeroConcurrency {
        /// Which tier failed validation.
        tier: &'static str,
        /// The offending value.
        actual: usize,
    },
    /// A tier's timeout was configured below a sane floor.
    #[error("{tier} timeout must be at least {minimum:?}, got {actual:?}")]
    TimeoutTooLow {
        /// Which tier failed validation.
        tier: &'static str,
        /// The minimum allowed timeout.
        minimum: Duration,
        /// The offending value.
        actual: Duration,
    },
    /// No tier-3 providers were configured at all.
    #[error("router config declares no tier-3 providers")]
    NoProviders,
    /// Two providers were declared with the same name.
    #[error("duplicate provider name: {0}")]
    DuplicateProvider(ProviderName),
    /// A composite-score weight triple did not sum close to 1.0.
    #[error("composite score weights must sum to ~1.0, got {actual}")]
    WeightsDoNotSumToOne {
        /// The actual sum observed.
        actual: f32,
    },
}

impl RouterConfig {
    /// Loads a `RouterConfig` from a YAML file and validates it.
    pub fn load(path: &Path) -> Result<Self, RouterConfigError> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// A permissive configuration for local development: short timeouts,
    /// low concurrency, a single local provider, no daily cap.
    #[must_use]
    pub fn development() -> Self {
        Self {
            tier1: TierConfig {
                model: ModelId::try_new("micro-classifier-dev").expect("valid model id"),
                context_length: 4_096,
                max_output_tokens: 256,
                temperature: 0.0,
                timeout: Duration::from_secs(5),
                concurrency: 2,
            },
            tier2: TierConfig {
                model: ModelId::try_new("light-reasoner-dev").expect("valid model id"),
                context_length: 8_192,
                max_output_tokens: 1_024,
                temperature: 0.2,
                timeout: Duration::from_secs(20),
                concurrency: 2,
            },
            providers: vec![ProviderSpec {
                name: ProviderName::try_new("local-dev").expect("valid provider name"),
                host: "http://localhost:11434".to_string(),
                model: ModelId::try_new("llama3.1:8b").expect("valid model id"),
                input_cost_per_1k: rust_decimal::Decimal::ZERO,
                output_cost_per_1k: rust_decimal::Decimal::ZERO,
                quality: 0.6,
                max_context: 8_192,
                tags: vec!["local".to_string()],
                daily_cap: None,
            }],
            escalation: EscalationCriteria {
                confidence_threshold: 0.6,
                complexity_threshold: 0.7,
                quality_threshold: 0.5,
                reasoning_depth_threshold: 0.7,
                weights: ScoreWeights::default(),
                composite_threshold: 0.5,
            },
            selection_strategy: SelectionStrategy::PreferLocal,
            daily_aggregate_cap: None,
            max_node_visits: 8,
        }
    }

    /// A conservative configuration suitable for a live pipeline: longer
    /// timeouts, higher concurrency, a frontier provider pool with real
    /// costs and an aggregate daily cap.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::development();
        config.tier1.timeout = Duration::from_secs(5);
        config.tier1.concurrency = 8;
        config.tier2.timeout = Duration::from_secs(30);
        config.tier2.concurrency = 4;
        config.providers = vec![
            ProviderSpec {
                name: ProviderName::try_new("dgx").expect("valid provider name"),
                host: "http://dgx.internal:8000".to_string(),
                model: ModelId::try_new("llama3.1:70b").expect("valid model id"),
                input_cost_per_1k: rust_decimal::Decimal::ZERO,
                output_cost_per_1k: rust_decimal::Decimal::ZERO,
                quality: 0.75,
                max_context: 32_768,
                tags: vec!["local".to_string(), "dgx".to_string()],
                daily_cap: None,
            },
            ProviderSpec {
                name: ProviderName::try_new("cloud-anthropic").expect("valid provider name"),
                host: "https://api.anthropic.com".to_string(),
                model: ModelId::try_new("claude-3-5-sonnet-latest").expect("valid model id"),
                input_cost_per_1k: rust_decimal::Decimal::new(300, 2),
                output_cost_per_1k: rust_decimal::Decimal::new(1500, 2),
                quality: 0.95,
                max_context: 200_000,
                tags: vec!["cloud".to_string(), "frontier".to_string()],
                daily_cap: Some(500),
            },
            ProviderSpec {
                name: ProviderName::try_new("cloud-openai").expect("valid provider name"),
                host: "https://api.openai.com".to_string(),
                model: ModelId::try_new("gpt-4o").expect("valid model id"),
                input_cost_per_1k: rust_decimal::Decimal::new(250, 2),
                output_cost_per_1k: rust_decimal::Decimal::new(1000, 2),
                quality: 0.93,
                max_context: 128_000,
                tags: vec!["cloud".to_string(), "frontier".to_string()],
                daily_cap: Some(500),
            },
        ];
        config.selection_strategy = SelectionStrategy::CheapestQualified;
        config.daily_aggregate_cap = Some(1_200);
        config
    }

    /// Validates internal consistency: concurrency floors, timeout floors,
    /// provider uniqueness, and weight normalization.
    pub fn validate(&self) -> Result<(), RouterConfigError> {
        for (name, tier) in [("tier1", &self.tier1), ("tier2", &self.tier2)] {
            if tier.concurrency == 0 {
                return Err(RouterConfigError::ZeroConcurrency {
                    tier: name,
                    actual: tier.concurrency,
                });
            }
            let minimum = Duration::from_secs(1);
            if tier.timeout < minimum {
                return Err(RouterConfigError::TimeoutTooLow {
                    tier: name,
                    minimum,
                    actual: tier.timeout,
                });
            }
        }

        if self.providers.is_empty() {
            return Err(RouterConfigError::NoProviders);
        }

        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.name.clone()) {
                return Err(RouterConfigError::DuplicateProvider(provider.name.clone()));
            }
        }

        let w = &self.escalation.weights;
        let sum = w.complexity + w.confidence + w.hallucination;
        if (sum - 1.0).abs() > 0.05 {
            return Err(RouterConfigError::WeightsDoNotSumToOne { actual: sum });
        }

        Ok(())
    }
}

mod humantime_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_preset_validates() {
        RouterConfig::development().validate().expect("valid");
    }

    #[test]
    fn production_preset_validates() {
        RouterConfig::production().validate().expect("valid");
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = RouterConfig::development();
        config.tier1.concurrency = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, RouterConfigError::ZeroConcurrency { .. }));
    }

    #[test]
    fn empty_provider_pool_is_rejected() {
        let mut config = RouterConfig::development();
        config.providers.clear();
        assert!(matches!(
            config.validate().unwrap_err(),
            RouterConfigError::NoProviders
        ));
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let mut config = RouterConfig::development();
        let dup = config.providers[0].clone();
        config.providers.push(dup);
        assert!(matches!(
            config.validate().unwrap_err(),
            RouterConfigError::DuplicateProvider(_)
        ));
    }

    #[test]
    fn lopsided_weights_are_rejected() {
        let mut config = RouterConfig::development();
        config.escalation.weights = ScoreWeights {
            complexity: 0.9,
            confidence: 0.9,
            hallucination: 0.9,
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            RouterConfigError::WeightsDoNotSumToOne { .. }
        ));
    }
}
