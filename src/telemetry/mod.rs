//! Budget & Telemetry (spec §4.8): per-run token/cost accounting with an
//! 80%-degradation hint, an in-memory metrics collector, and a credential
//! redaction pass applied to every structured event before it is logged or
//! persisted.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{CostCents, ProviderName, Tier, TokenCount};

/// Fixed literal substituted for any redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Case-insensitive substrings of a JSON object key that mark its value as
/// a credential, subject to redaction before logging or persisting (spec
/// §4.8.1, §7).
const CREDENTIAL_KEY_PATTERNS: &[&str] =
    &["key", "token", "secret", "password", "authorization", "bearer"];

/// Recursively walks a JSON value, replacing the value of any object key
/// that matches a credential pattern with [`REDACTED`]. Arrays and nested
/// objects are walked; scalars and non-matching keys pass through unchanged.
#[must_use]
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    if is_credential_key(k) {
                        (k.clone(), Value::String(REDACTED.to_string()))
                    } else {
                        (k.clone(), redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn is_credential_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    CREDENTIAL_KEY_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Per-node, per-run, or per-scope token/cost totals (spec §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    /// Tokens consumed so far.
    pub tokens: TokenCount,
    /// Cost accrued so far.
    pub cost: CostCents,
}

impl BudgetUsage {
    /// Adds a call's tokens and cost to the running total.
    pub fn record(&mut self, tokens: TokenCount, cost: CostCents) {
        self.tokens = self.tokens.plus(tokens);
        self.cost = self.cost.plus(cost);
    }

    /// Whether usage has crossed 80% of `cap_tokens` (degradation hint,
    /// spec §4.7.1 budget check / §4.8).
    #[must_use]
    pub fn is_degraded(&self, cap_tokens: TokenCount) -> bool {
        if cap_tokens.into_inner() == 0 {
            return false;
        }
        let used = self.tokens.into_inner() as f64;
        let cap = cap_tokens.into_inner() as f64;
        used / cap >= 0.8
    }

    /// Whether usage has exceeded `cap_tokens` outright.
    #[must_use]
    pub fn is_exceeded(&self, cap_tokens: TokenCount) -> bool {
        cap_tokens.into_inner() > 0 && self.tokens.into_inner() > cap_tokens.into_inner()
    }
}

/// Snapshot of the metrics collected for one completed run, returned by
/// [`MetricsCollector::run_summary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Wall-clock duration of the run.
    pub duration: Duration,
    /// Total input + output tokens across all node calls.
    pub total_tokens: TokenCount,
    /// Total cost across all node calls.
    pub total_cost: CostCents,
    /// Fraction of calls that escalated to tier 3.
    pub frontier_call_rate: f64,
    /// Fraction of agent outputs that failed schema validation even after
    /// the full recovery pipeline.
    pub qa_failure_rate: f64,
}

/// Aggregate, process-wide router metrics (spec §4.8): tier distribution,
/// escalation rate, provider distribution, cost by provider, and average
/// latency/quality by tier.
#[derive(Debug, Default)]
struct RouterMetrics {
    tier_counts: HashMap<u8, u64>,
    escalations: u64,
    dispatches: u64,
    provider_counts: HashMap<ProviderName, u64>,
    provider_cost: HashMap<ProviderName, Decimal>,
    tier_latency_total_ms: HashMap<u8, u64>,
    tier_latency_count: HashMap<u8, u64>,
    tier_quality_total: HashMap<u8, f64>,
    tier_quality_count: HashMap<u8, u64>,
}

#[derive(Debug, Default)]
struct RunTally {
    started_at: Option<std::time::Instant>,
    ended_at: Option<std::time::Instant>,
    total_tokens: TokenCount,
    total_cost: CostCents,
    dispatch_count: u64,
    frontier_count: u64,
    qa_failures: u64,
    qa_attempts: u64,
}

/// Process-wide, in-memory metrics collector (spec §4.8). Shared across
/// runs behind an `Arc`; all mutation happens through an internal mutex so
/// callers never need external synchronization.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    router: Mutex<RouterMetrics>,
    runs: Mutex<HashMap<String, RunTally>>,
}

impl MetricsCollector {
    /// Creates an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a run as started, for duration tracking.
    pub fn run_started(&self, run_id: &str) {
        let mut runs = self.runs.lock().expect("metrics mutex poisoned");
        runs.entry(run_id.to_string()).or_default().started_at = Some(std::time::Instant::now());
    }

    /// Marks a run as ended, for duration tracking.
    pub fn run_ended(&self, run_id: &str) {
        let mut runs = self.runs.lock().expect("metrics mutex poisoned");
        if let Some(tally) = runs.get_mut(run_id) {
            tally.ended_at = Some(std::time::Instant::now());
        }
    }

    /// Ids of every run this collector has recorded anything for, for the
    /// dashboard's `/runs` listing.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        self.runs.lock().expect("metrics mutex poisoned").keys().cloned().collect()
    }

    /// Records one tier dispatch: which tier served the request, whether it
    /// escalated from a lower tier, which provider (if any) was used, its
    /// cost, latency, and quality score.
    #[allow(clippy::too_many_arguments)]
    pub fn record_dispatch(
        &self,
        run_id: &str,
        tier: Tier,
        escalated: bool,
        provider: Option<&ProviderName>,
        tokens: TokenCount,
        cost: CostCents,
        latency: Duration,
        quality: Option<f64>,
    ) {
        {
            let mut router = self.router.lock().expect("metrics mutex poisoned");
            *router.tier_counts.entry(tier.as_u8()).or_insert(0) += 1;
            router.dispatches += 1;
            if escalated {
                router.escalations += 1;
            }
            if let Some(provider) = provider {
                *router.provider_counts.entry(provider.clone()).or_insert(0) += 1;
                *router
                    .provider_cost
                    .entry(provider.clone())
                    .or_insert(Decimal::ZERO) += cost.into_inner();
            }
            *router.tier_latency_total_ms.entry(tier.as_u8()).or_insert(0) +=
                u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
            *router.tier_latency_count.entry(tier.as_u8()).or_insert(0) += 1;
            if let Some(quality) = quality {
                *router.tier_quality_total.entry(tier.as_u8()).or_insert(0.0) += quality;
                *router.tier_quality_count.entry(tier.as_u8()).or_insert(0) += 1;
            }
        }

        let mut runs = self.runs.lock().expect("metrics mutex poisoned");
        let tally = runs.entry(run_id.to_string()).or_default();
        tally.total_tokens = tally.total_tokens.plus(tokens);
        tally.total_cost = tally.total_cost.plus(cost);
        tally.dispatch_count += 1;
        if tier == Tier::Three {
            tally.frontier_count += 1;
        }
    }

    /// Records one agent output validation attempt, for the QA failure
    /// rate metric.
    pub fn record_validation(&self, run_id: &str, passed: bool) {
        let mut runs = self.runs.lock().expect("metrics mutex poisoned");
        let tally = runs.entry(run_id.to_string()).or_default();
        tally.qa_attempts += 1;
        if !passed {
            tally.qa_failures += 1;
        }
    }

    /// Returns a summary for `run_id`, or `None` if nothing was recorded
    /// for it.
    #[must_use]
    pub fn run_summary(&self, run_id: &str) -> Option<RunSummary> {
        let runs = self.runs.lock().expect("metrics mutex poisoned");
        let tally = runs.get(run_id)?;
        let duration = match (tally.started_at, tally.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        let frontier_call_rate = if tally.dispatch_count == 0 {
            0.0
        } else {
            tally.frontier_count as f64 / tally.dispatch_count as f64
        };
        let qa_failure_rate = if tally.qa_attempts == 0 {
            0.0
        } else {
            tally.qa_failures as f64 / tally.qa_attempts as f64
        };
        Some(RunSummary {
            duration,
            total_tokens: tally.total_tokens,
            total_cost: tally.total_cost,
            frontier_call_rate,
            qa_failure_rate,
        })
    }

    /// Fraction of dispatches that escalated past their requested tier.
    #[must_use]
    pub fn escalation_rate(&self) -> f64 {
        let router = self.router.lock().expect("metrics mutex poisoned");
        if router.dispatches == 0 {
            0.0
        } else {
            router.escalations as f64 / router.dispatches as f64
        }
    }

    /// Count of dispatches served by each tier.
    #[must_use]
    pub fn tier_distribution(&self) -> HashMap<u8, u64> {
        self.router.lock().expect("metrics mutex poisoned").tier_counts.clone()
    }

    /// Count of calls served by each provider.
    #[must_use]
    pub fn provider_distribution(&self) -> HashMap<ProviderName, u64> {
        self.router.lock().expect("metrics mutex poisoned").provider_counts.clone()
    }

    /// Total cost attributed to each provider.
    #[must_use]
    pub fn cost_by_provider(&self) -> HashMap<ProviderName, Decimal> {
        self.router.lock().expect("metrics mutex poisoned").provider_cost.clone()
    }

    /// Average call latency for a given tier, in milliseconds.
    #[must_use]
    pub fn average_latency_ms(&self, tier: Tier) -> Option<f64> {
        let router = self.router.lock().expect("metrics mutex poisoned");
        let total = *router.tier_latency_total_ms.get(&tier.as_u8())?;
        let count = *router.tier_latency_count.get(&tier.as_u8())?;
        (count > 0).then_some(total as f64 / count as f64)
    }

    /// Average quality score observed for a given tier.
    #[must_use]
    pub fn average_quality(&self, tier: Tier) -> Option<f64> {
        let router = self.router.lock().expect("metrics mutex poisoned");
        let total = *router.tier_quality_total.get(&tier.as_u8())?;
        let count = *router.tier_quality_count.get(&tier.as_u8())?;
        (count > 0).then_some(total / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redact_replaces_credential_valued_keys() {
        let input = json!({
            "api_key": "sk-live-abc123",
            "Authorization": "Bearer xyz",
            "note": "not sensitive",
            "nested": { "password": "hunter2", "count": 3 },
        });
        let redacted = redact(&input);
        assert_eq!(redacted["api_key"], json!(REDACTED));
        assert_eq!(redacted["Authorization"], json!(REDACTED));
        assert_eq!(redacted["note"], json!("not sensitive"));
        assert_eq!(redacted["nested"]["password"], json!(REDACTED));
        assert_eq!(redacted["nested"]["count"], json!(3));
    }

    #[test]
    fn redact_walks_arrays_of_objects() {
        let input = json!([{ "token": "abc" }, { "other": "fine" }]);
        let redacted = redact(&input);
        assert_eq!(redacted[0]["token"], json!(REDACTED));
        assert_eq!(redacted[1]["other"], json!("fine"));
    }

    #[test]
    fn budget_usage_flags_degradation_at_eighty_percent() {
        let mut usage = BudgetUsage::default();
        usage.record(TokenCount::new(800), CostCents::zero());
        assert!(usage.is_degraded(TokenCount::new(1000)));
        assert!(!usage.is_exceeded(TokenCount::new(1000)));
    }

    #[test]
    fn budget_usage_flags_hard_exceed() {
        let mut usage = BudgetUsage::default();
        usage.record(TokenCount::new(1200), CostCents::zero());
        assert!(usage.is_exceeded(TokenCount::new(1000)));
    }

    #[test]
    fn collector_tracks_tier_distribution_and_escalation_rate() {
        let collector = MetricsCollector::new();
        collector.run_started("run-1");
        collector.record_dispatch(
            "run-1",
            Tier::One,
            false,
            None,
            TokenCount::new(100),
            CostCents::zero(),
            Duration::from_millis(50),
            Some(0.9),
        );
        collector.record_dispatch(
            "run-1",
            Tier::Three,
            true,
            Some(&ProviderName::try_new("anthropic").unwrap()),
            TokenCount::new(500),
            CostCents::from_tokens(TokenCount::new(500), Decimal::new(2, 2)),
            Duration::from_millis(900),
            Some(0.95),
        );
        collector.run_ended("run-1");

        assert_eq!(collector.tier_distribution().get(&3), Some(&1));
        assert!((collector.escalation_rate() - 0.5).abs() < f64::EPSILON);
        let summary = collector.run_summary("run-1").expect("run recorded");
        assert_eq!(summary.total_tokens, TokenCount::new(600));
        assert!((summary.frontier_call_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn collector_tracks_qa_failure_rate() {
        let collector = MetricsCollector::new();
        collector.record_validation("run-2", true);
        collector.record_validation("run-2", false);
        collector.record_validation("run-2", false);
        let summary = collector.run_summary("run-2").expect("run recorded");
        assert!((summary.qa_failure_rate - (2.0 / 3.0)).abs() < f64::EPSILON);
    }
}
