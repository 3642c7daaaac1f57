//! Provider Registry: a named pool of tier-3 frontier providers with
//! cost/quality metadata, strategy-based selection, availability tracking,
//! and daily cap accounting.
//!
//! Grounded on the teacher's `message_router` selection logic (strategy-based
//! picking among registered backends) generalized from agent routing to
//! model-provider routing, and on the `dashmap`-backed registries used
//! elsewhere in the teacher codebase for process-wide shared state that
//! needs per-key mutability without a single global lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::adapters::ModelAdapter;
use crate::config::SelectionStrategy;
use crate::domain::{CostCents, ProviderName, TokenCount, UnitScore};
use crate::time_provider::SharedTimeProvider;

/// Cost/quality/availability metadata for a single registered provider, plus
/// a handle to the adapter that actually performs calls.
#[derive(Clone)]
pub struct ProviderEntry {
    /// Unique name used in routing decisions and telemetry.
    pub name: ProviderName,
    /// The adapter used to actually reach this provider.
    pub adapter: Arc<dyn ModelAdapter>,
    /// Cost in cents per 1000 input tokens.
    pub input_cost_per_1k: Decimal,
    /// Cost in cents per 1000 output tokens.
    pub output_cost_per_1k: Decimal,
    /// Quality score in `[0.0, 1.0]`.
    pub quality: UnitScore,
    /// Maximum input context length this provider accepts.
    pub max_context: u32,
    /// Free-form tags (`local`, `dgx`, `cloud`, `frontier`, ...).
    pub tags: HashSet<String>,
    /// Maximum calls to this provider per local day, `None` for unlimited.
    pub daily_cap: Option<u64>,
}

impl ProviderEntry {
    /// Estimates the cost of a call given input/output token counts.
    #[must_use]
    pub fn estimate_cost(&self, input_tokens: TokenCount, output_tokens: TokenCount) -> CostCents {
        CostCents::from_tokens(input_tokens, self.input_cost_per_1k)
            .plus(CostCents::from_tokens(output_tokens, self.output_cost_per_1k))
    }

    fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|tag| self.tags.contains(tag))
    }
}

/// Filter applied when selecting a tier-3 provider.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequirements {
    /// Minimum acceptable quality score.
    pub min_quality: UnitScore,
    /// Maximum acceptable output cost per 1k tokens, `None` for unbounded.
    pub max_cost_per_1k: Option<Decimal>,
    /// Minimum context length the provider must support.
    pub min_context: u32,
    /// Tags the provider must carry, e.g. `["frontier"]`.
    pub required_tags: Vec<String>,
}

/// Per-provider mutable bookkeeping: the lazily-reset daily call counter and
/// last-failure timestamp. Availability lives separately in `availability`
/// below, since it's toggled far more often than the rest of this state.
struct ProviderState {
    daily_calls: AtomicU64,
    reset_date: std::sync::Mutex<NaiveDate>,
    last_failure: std::sync::Mutex<Option<crate::domain::Timestamp>>,
}

impl ProviderState {
    fn new(today: NaiveDate) -> Self {
        Self {
            daily_calls: AtomicU64::new(0),
            reset_date: std::sync::Mutex::new(today),
            last_failure: std::sync::Mutex::new(None),
        }
    }

    fn roll_day_if_needed(&self, today: NaiveDate) {
        let mut reset_date = self.reset_date.lock().expect("reset_date mutex poisoned");
        if *reset_date != today {
            *reset_date = today;
            self.daily_calls.store(0, Ordering::Relaxed);
        }
    }
}

/// A process-wide, shared registry of tier-3 providers. Cloning shares the
/// underlying state (it's a thin handle over `Arc`-backed maps).
#[derive(Clone)]
pub struct ProviderRegistry {
    entries: Arc<DashMap<ProviderName, ProviderEntry>>,
    availability: Arc<DashMap<ProviderName, bool>>,
    state: Arc<DashMap<ProviderName, ProviderState>>,
    aggregate_calls: Arc<AtomicU64>,
    aggregate_reset_date: Arc<std::sync::Mutex<NaiveDate>>,
    aggregate_cap: Option<u64>,
    time: SharedTimeProvider,
}

impl ProviderRegistry {
    /// Builds an empty registry with the given aggregate daily cap.
    #[must_use]
    pub fn new(aggregate_cap: Option<u64>, time: SharedTimeProvider) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            availability: Arc::new(DashMap::new()),
            state: Arc::new(DashMap::new()),
            aggregate_calls: Arc::new(AtomicU64::new(0)),
            aggregate_reset_date: Arc::new(std::sync::Mutex::new(Self::today(&time))),
            aggregate_cap,
            time,
        }
    }

    fn today(time: &SharedTimeProvider) -> NaiveDate {
        chrono::DateTime::<chrono::Local>::from(time.now()).date_naive()
    }

    /// Registers a new provider. Replaces any prior entry with the same name
    /// but preserves its availability/counter state.
    pub fn register(&self, entry: ProviderEntry) {
        let name = entry.name.clone();
        self.availability.entry(name.clone()).or_insert(true);
        self.state
            .entry(name.clone())
            .or_insert_with(|| ProviderState::new(Self::today(&self.time)));
        self.entries.insert(name, entry);
    }

    /// Marks a provider unavailable, e.g. after a transient failure.
    pub fn mark_unavailable(&self, name: &ProviderName) {
        self.availability.insert(name.clone(), false);
        if let Some(state) = self.state.get(name) {
            let mut last_failure = state.last_failure.lock().expect("mutex poisoned");
            *last_failure = Some(chrono::DateTime::<chrono::Utc>::from(self.time.now()));
        }
    }

    /// Marks a provider available again.
    pub fn mark_available(&self, name: &ProviderName) {
        self.availability.insert(name.clone(), true);
    }

    /// Records one call against a provider's daily counter and the aggregate
    /// counter, rolling both over if the local date has advanced.
    pub fn record_call(&self, name: &ProviderName) {
        let today = Self::today(&self.time);
        {
            let mut reset = self
                .aggregate_reset_date
                .lock()
                .expect("aggregate reset mutex poisoned");
            if *reset != today {
                *reset = today;
                self.aggregate_calls.store(0, Ordering::Relaxed);
            }
        }
        self.aggregate_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(state) = self.state.get(name) {
            state.roll_day_if_needed(today);
            state.daily_calls.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True if either the provider's own daily cap or the aggregate cap has
    /// already been reached.
    #[must_use]
    pub fn is_cap_exceeded(&self, name: &ProviderName) -> bool {
        let today = Self::today(&self.time);
        if let Some(cap) = self.aggregate_cap {
            let mut reset = self
                .aggregate_reset_date
                .lock()
                .expect("aggregate reset mutex poisoned");
            if *reset != today {
                *reset = today;
                self.aggregate_calls.store(0, Ordering::Relaxed);
            }
            if self.aggregate_calls.load(Ordering::Relaxed) >= cap {
                return true;
            }
        }

        let Some(entry) = self.entries.get(name) else {
            return false;
        };
        let Some(cap) = entry.daily_cap else {
            return false;
        };
        let Some(state) = self.state.get(name) else {
            return false;
        };
        state.roll_day_if_needed(today);
        state.daily_calls.load(Ordering::Relaxed) >= cap
    }

    fn is_available(&self, name: &ProviderName) -> bool {
        self.availability.get(name).map(|v| *v).unwrap_or(false)
    }

    fn candidates(&self, requirements: &SelectionRequirements) -> Vec<ProviderEntry> {
        self.entries
            .iter()
            .map(|e| e.value().clone())
            .filter(|e| self.is_available(&e.name))
            .filter(|e| e.quality >= requirements.min_quality)
            .filter(|e| e.max_context >= requirements.min_context)
            .filter(|e| e.has_tags(&requirements.required_tags))
            .filter(|e| {
                requirements
                    .max_cost_per_1k
                    .is_none_or(|max| e.output_cost_per_1k <= max)
            })
            .collect()
    }

    fn order(entries: &mut [ProviderEntry], strategy: SelectionStrategy) {
        match strategy {
            SelectionStrategy::CheapestQualified => entries.sort_by(|a, b| {
                a.output_cost_per_1k
                    .cmp(&b.output_cost_per_1k)
                    .then_with(|| a.name.cmp(&b.name))
            }),
            SelectionStrategy::HighestQuality => entries.sort_by(|a, b| {
                b.quality
                    .partial_cmp(&a.quality)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.name.cmp(&b.name))
            }),
            SelectionStrategy::PreferLocal => entries.sort_by(|a, b| {
                let a_local = a.tags.contains("local") || a.tags.contains("dgx");
                let b_local = b.tags.contains("local") || b.tags.contains("dgx");
                b_local
                    .cmp(&a_local)
                    .then_with(|| {
                        b.quality
                            .partial_cmp(&a.quality)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .then_with(|| a.name.cmp(&b.name))
            }),
        }
    }

    /// Selects the best-ranked provider satisfying `requirements`, or `None`
    /// if no registered provider qualifies.
    #[must_use]
    pub fn select(
        &self,
        requirements: &SelectionRequirements,
        strategy: SelectionStrategy,
    ) -> Option<ProviderEntry> {
        let mut candidates = self.candidates(requirements);
        Self::order(&mut candidates, strategy);
        candidates.into_iter().next()
    }

    /// Selects the best-ranked provider, excluding any name already in
    /// `exclude` (used by the tier-3 fallback loop).
    #[must_use]
    pub fn select_with_fallback(
        &self,
        requirements: &SelectionRequirements,
        strategy: SelectionStrategy,
        exclude: &HashSet<ProviderName>,
    ) -> Option<ProviderEntry> {
        let mut candidates: Vec<_> = self
            .candidates(requirements)
            .into_iter()
            .filter(|e| !exclude.contains(&e.name))
            .collect();
        Self::order(&mut candidates, strategy);
        candidates.into_iter().next()
    }

    /// Returns a clone of the named provider entry, regardless of
    /// availability, for diagnostics and tuning.
    #[must_use]
    pub fn get(&self, name: &ProviderName) -> Option<ProviderEntry> {
        self.entries.get(name).map(|e| e.value().clone())
    }

    /// Number of providers currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no providers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
