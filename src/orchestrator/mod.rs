//! Graph Orchestrator: walks a [`GraphConfig`] node by node, owning the
//! single [`RunState`] for the run's lifetime (design note §9: "per-run
//! mutable state owned by one walker — no locks needed inside a run").
//!
//! Grounded on the teacher's FIPA conversation state machine (a single
//! owner stepping through `pending → running → terminal` states) adapted
//! from agent-to-agent message exchange to agent-to-agent-graph node
//! execution.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::adapters::{ModelApiError, ModelCallOutcome};
use crate::agent::{Agent, AgentError, ModelCallable};
use crate::config::GraphConfig;
use crate::domain::{AgentId, CostCents, NodeId, ProviderName, RunId, Tier, Timestamp, TokenCount, UnitScore};
use crate::router::{ModelRouter, TierSelection};
use crate::state::RunState;
use crate::time_provider::SharedTimeProvider;

/// Wraps a node's chosen callable to harvest the token counts spent across
/// every attempt the agent runtime makes (the initial call plus any
/// recovery re-asks), so the orchestrator can fold them into the run's
/// budget totals after `agent.run` returns (spec §4.7 step 2).
struct TrackingCallable {
    inner: Arc<dyn ModelCallable + Send + Sync>,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl TrackingCallable {
    fn new(inner: Arc<dyn ModelCallable + Send + Sync>) -> Self {
        Self {
            inner,
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    fn totals(&self) -> (TokenCount, TokenCount) {
        (
            TokenCount::new(self.input_tokens.load(Ordering::Relaxed)),
            TokenCount::new(self.output_tokens.load(Ordering::Relaxed)),
        )
    }
}

#[async_trait]
impl ModelCallable for TrackingCallable {
    async fn call(&self, system: &str, user: &str) -> Result<ModelCallOutcome, ModelApiError> {
        let outcome = self.inner.call(system, user).await?;
        self.input_tokens.fetch_add(outcome.input_tokens.into_inner(), Ordering::Relaxed);
        self.output_tokens.fetch_add(outcome.output_tokens.into_inner(), Ordering::Relaxed);
        Ok(outcome)
    }
}

/// Failures raised while walking a graph. No common ancestor is required
/// by spec §7; these are grouped into one enum because the orchestrator
/// is the sole caller that needs to match on all of them together.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The graph itself is malformed (should be caught by
    /// [`GraphConfig::validate`] at load time; this is a defensive
    /// fallback for it surfacing at walk time instead).
    #[error("graph error: {0}")]
    Graph(String),
    /// A node referenced an agent id with no registered implementation.
    #[error("no agent registered for id {0}")]
    UnknownAgent(AgentId),
    /// A node's required input key was absent from run state.
    #[error("node {node} requires state key '{key}', which is not set")]
    MissingState {
        /// The node that required the key.
        node: NodeId,
        /// The unresolved key.
        key: String,
    },
    /// A node's per-node budget cap was exceeded.
    #[error("node {node} exceeded its budget cap")]
    BudgetExceeded {
        /// The node whose budget was exceeded.
        node: NodeId,
    },
    /// A node failed after exhausting its retry policy, with no
    /// `on_fail` target to route to.
    #[error("node {node} failed after retries: {source}")]
    Node {
        /// The node that failed.
        node: NodeId,
        /// The underlying agent failure.
        #[source]
        source: AgentError,
    },
    /// The per-run node-visit cap was exceeded — almost certainly an
    /// unbounded `on_fail` cycle (spec §4.7.1 / §9).
    #[error("run exceeded max node visits ({max}); likely an on_fail cycle")]
    CycleLimitExceeded {
        /// The configured cap.
        max: u32,
    },
}

/// The terminal outcome of a completed run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The run reached a terminal node without crossing the degradation
    /// threshold.
    Succeeded {
        /// The final run state.
        final_state: HashMap<String, Value>,
    },
    /// The run reached a terminal node, but crossed 80% of some node's
    /// budget along the way.
    Degraded {
        /// The final run state.
        final_state: HashMap<String, Value>,
    },
}

/// The durable form of a Routing Decision (spec §3), handed to an
/// injected [`RoutingDecisionSink`] on a best-effort basis.
#[derive(Debug, Clone)]
pub struct RoutingDecisionRecord {
    /// The run this decision belongs to.
    pub run_id: RunId,
    /// The node this decision was made for.
    pub node_id: NodeId,
    /// The agent invoked at this node.
    pub agent_id: AgentId,
    /// The tier the agent's policy preferred.
    pub request_tier: Tier,
    /// The tier ultimately chosen after escalation.
    pub chosen_tier: Tier,
    /// The provider selected, if `chosen_tier == Tier::Three`.
    pub provider_name: Option<ProviderName>,
    /// Human-readable escalation rationale.
    pub reason: String,
    /// Confidence signal at decision time.
    pub confidence: UnitScore,
    /// Complexity signal at decision time.
    pub complexity: UnitScore,
    /// Wall-clock time spent executing the node's agent, including the
    /// model call.
    pub latency_ms: u64,
    /// When this decision was recorded.
    pub timestamp: Timestamp,
}

/// Best-effort checkpoint persistence: failures are logged and swallowed,
/// never propagated into the run (spec §4.7 step 9, §7 "persistence
/// errors ... are never fatal").
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists the state and last-completed node after a successful
    /// node execution.
    async fn save_checkpoint(
        &self,
        run_id: RunId,
        completed_node: &NodeId,
        state: &HashMap<String, Value>,
    ) -> anyhow::Result<()>;

    /// Loads the most recent checkpoint for `run_id`, if any, so
    /// [`GraphOrchestrator::resume`] can re-enter at the next node.
    async fn load_checkpoint(
        &self,
        run_id: RunId,
    ) -> anyhow::Result<Option<(NodeId, HashMap<String, Value>)>>;
}

/// Best-effort routing-decision persistence (spec §4.7 step 6).
#[async_trait]
pub trait RoutingDecisionSink: Send + Sync {
    /// Records one routing decision.
    async fn record(&self, decision: RoutingDecisionRecord) -> anyhow::Result<()>;
}

/// Walks a [`GraphConfig`], invoking each node's agent in turn and
/// merging its delta into a single owned [`RunState`].
pub struct GraphOrchestrator {
    graph: GraphConfig,
    agents: HashMap<AgentId, Arc<dyn Agent>>,
    router: Option<Arc<ModelRouter>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    routing_sink: Option<Arc<dyn RoutingDecisionSink>>,
    time: SharedTimeProvider,
}

impl GraphOrchestrator {
    /// Builds an orchestrator over a validated graph and its agent
    /// implementations. `router`, `checkpoints`, and `routing_sink` are
    /// all optional: without a router every node calls its agent with no
    /// callable (suitable for deterministic-only graphs or tests);
    /// without persistence, checkpoints and routing decisions are simply
    /// not recorded.
    #[must_use]
    pub fn new(
        graph: GraphConfig,
        agents: HashMap<AgentId, Arc<dyn Agent>>,
        router: Option<Arc<ModelRouter>>,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
        routing_sink: Option<Arc<dyn RoutingDecisionSink>>,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            graph,
            agents,
            router,
            checkpoints,
            routing_sink,
            time,
        }
    }

    /// Runs the graph to completion from its entry node with a fresh run
    /// state seeded by the caller (e.g. tier-0 command args).
    #[instrument(skip(self, seed), fields(run_id = %run_id))]
    pub async fn run(&self, run_id: RunId, seed: HashMap<String, Value>) -> Result<RunOutcome, OrchestratorError> {
        self.walk(run_id, self.graph.entry.clone(), RunState::seeded(seed))
            .await
    }

    /// Resumes a previously checkpointed run at its last-completed node's
    /// successor, replaying no prior nodes.
    pub async fn resume(&self, run_id: RunId) -> Result<RunOutcome, OrchestratorError> {
        let Some(checkpoints) = &self.checkpoints else {
            return Err(OrchestratorError::Graph(
                "no checkpoint store configured; cannot resume".to_string(),
            ));
        };
        let loaded = checkpoints
            .load_checkpoint(run_id)
            .await
            .map_err(|e| OrchestratorError::Graph(format!("failed to load checkpoint: {e}")))?;
        let Some((completed_node, snapshot)) = loaded else {
            return Err(OrchestratorError::Graph(format!("no checkpoint found for run {run_id}")));
        };

        let spec = self
            .graph
            .nodes
            .get(&completed_node)
            .ok_or_else(|| OrchestratorError::Graph(format!("checkpointed node {completed_node} no longer exists")))?;
        let next = spec
            .next
            .clone()
            .ok_or_else(|| OrchestratorError::Graph(format!("checkpointed node {completed_node} has no next node")))?;

        self.walk(run_id, next, RunState::from_snapshot(snapshot)).await
    }

    async fn walk(&self, run_id: RunId, entry: NodeId, mut state: RunState) -> Result<RunOutcome, OrchestratorError> {
        let mut current = entry;
        let mut visit_counts: HashMap<NodeId, u32> = HashMap::new();
        let mut degraded = false;

        loop {
            let visits = visit_counts.entry(current.clone()).or_insert(0);
            *visits += 1;
            if *visits > self.graph.max_node_visits {
                return Err(OrchestratorError::CycleLimitExceeded {
                    max: self.graph.max_node_visits,
                });
            }

            let spec = self
                .graph
                .nodes
                .get(&current)
                .cloned()
                .ok_or_else(|| OrchestratorError::Graph(format!("node {current} is not defined")))?;

            for key in &spec.required_inputs {
                if !state.contains(key) {
                    return Err(OrchestratorError::MissingState {
                        node: current.clone(),
                        key: key.clone(),
                    });
                }
            }

            if let Some(budget) = &spec.budget {
                if let Some(max_tokens) = budget.max_tokens {
                    if state.budget_used_tokens().into_inner() > max_tokens {
                        return Err(OrchestratorError::BudgetExceeded { node: current.clone() });
                    }
                }
                if let Some(max_cost) = budget.max_cost_cents {
                    if state.budget_used_cost().into_inner() > max_cost {
                        return Err(OrchestratorError::BudgetExceeded { node: current.clone() });
                    }
                }
            }

            state.set_current_agent_id(&spec.agent_id);

            let agent = self
                .agents
                .get(&spec.agent_id)
                .cloned()
                .ok_or_else(|| OrchestratorError::UnknownAgent(spec.agent_id.clone()))?;

            let retry = spec.retry.unwrap_or_default();
            let max_attempts = retry.max_attempts.max(1);
            let mut attempt = 0;
            let mut last_err: Option<AgentError> = None;
            let mut delta: Option<HashMap<String, Value>> = None;

            while attempt < max_attempts {
                attempt += 1;
                let started = self.time.instant();

                let (callable, decision) = self.select_callable(agent.as_ref(), &state).await;

                let tracker = callable.map(TrackingCallable::new);
                let callable_ref = tracker
                    .as_ref()
                    .map(|c| c as &(dyn ModelCallable + Send + Sync));
                let outcome = agent.run(&state, callable_ref).await;
                let latency_ms = self.time.instant().duration_since(started).as_millis() as u64;
                if let Some(decision) = &decision {
                    self.record_routing_decision(run_id, &current, &spec.agent_id, decision, latency_ms)
                        .await;
                }

                match outcome {
                    Ok(d) => {
                        if let Some(tracker) = &tracker {
                            let (input_tokens, output_tokens) = tracker.totals();
                            self.record_node_usage(&mut state, decision.as_ref(), input_tokens, output_tokens);
                        }
                        delta = Some(d);
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        last_err = Some(e);
                        if attempt < max_attempts {
                            self.time.sleep(Duration::from_secs(retry.backoff_seconds)).await;
                        }
                    }
                }
            }

            match delta {
                Some(d) => {
                    state.merge(d);
                    if state.degradation_active() {
                        degraded = true;
                    }

                    if let Some(store) = &self.checkpoints {
                        if let Err(e) = store.save_checkpoint(run_id, &current, &state.snapshot()).await {
                            warn!(node = %current, error = %e, "failed to persist checkpoint; continuing");
                        }
                    }

                    if spec.end {
                        let final_state = state.snapshot();
                        info!(run_id = %run_id, degraded, "run reached terminal node");
                        return Ok(if degraded {
                            RunOutcome::Degraded { final_state }
                        } else {
                            RunOutcome::Succeeded { final_state }
                        });
                    }

                    current = spec
                        .next
                        .clone()
                        .ok_or_else(|| OrchestratorError::Graph(format!("node {current} has no next and is not terminal")))?;
                }
                None => {
                    if let Some(on_fail) = &spec.on_fail {
                        warn!(node = %current, target = %on_fail, "node failed; jumping to on_fail");
                        current = on_fail.clone();
                    } else {
                        return Err(OrchestratorError::Node {
                            node: current.clone(),
                            source: last_err.expect("delta is None only when an attempt recorded an error"),
                        });
                    }
                }
            }
        }
    }

    async fn select_callable(
        &self,
        agent: &dyn Agent,
        state: &RunState,
    ) -> (Option<Arc<dyn ModelCallable + Send + Sync>>, Option<TierSelection>) {
        if agent.policy().preferred_tier == Tier::Zero {
            return (None, None);
        }
        let Some(router) = &self.router else {
            return (None, None);
        };

        let decision = router.select_model(agent.policy(), state).await;
        let callable = router
            .get_callable(&decision)
            .await
            .map(|c| Arc::new(c) as Arc<dyn ModelCallable + Send + Sync>);
        (callable, Some(decision))
    }

    /// Folds one node's token spend into the run's cumulative budget
    /// totals and, at 80% of `max_run_tokens`, flips `_degradation_active`
    /// (spec §4.7 step 2).
    fn record_node_usage(
        &self,
        state: &mut RunState,
        decision: Option<&TierSelection>,
        input_tokens: TokenCount,
        output_tokens: TokenCount,
    ) {
        let cost = decision
            .and_then(|d| d.provider_name.as_ref())
            .and_then(|name| self.router.as_ref().and_then(|r| r.providers().get(name)))
            .map_or_else(CostCents::zero, |entry| entry.estimate_cost(input_tokens, output_tokens));

        let total_tokens = state.budget_used_tokens().plus(input_tokens).plus(output_tokens);
        let total_cost = state.budget_used_cost().plus(cost);
        state.record_budget_usage(total_tokens, total_cost, self.graph.max_run_tokens);
    }

    async fn record_routing_decision(
        &self,
        run_id: RunId,
        node: &NodeId,
        agent_id: &AgentId,
        decision: &TierSelection,
        latency_ms: u64,
    ) {
        let Some(sink) = &self.routing_sink else {
            return;
        };
        let record = RoutingDecisionRecord {
            run_id,
            node_id: node.clone(),
            agent_id: agent_id.clone(),
            request_tier: decision.request_tier,
            chosen_tier: decision.chosen_tier,
            provider_name: decision.provider_name.clone(),
            reason: decision.reason.clone(),
            confidence: decision.confidence,
            complexity: decision.complexity,
            latency_ms,
            timestamp: chrono::Utc::now(),
        };
        if let Err(e) = sink.record(record).await {
            warn!(node = %node, error = %e, "failed to persist routing decision; continuing");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeBudget, NodeSpec, RetryPolicy};
    use crate::domain::TokenCount;
    use crate::router::AgentPolicy;
    use crate::time_provider::test_time_provider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct DeterministicAgent {
        id: AgentId,
        output_key: &'static str,
        output_value: Value,
    }

    #[async_trait]
    impl Agent for DeterministicAgent {
        fn id(&self) -> &AgentId {
            &self.id
        }
        fn version(&self) -> &str {
            "v1"
        }
        fn policy(&self) -> &AgentPolicy {
            static POLICY: std::sync::OnceLock<AgentPolicy> = std::sync::OnceLock::new();
            POLICY.get_or_init(AgentPolicy::deterministic)
        }
        async fn run(
            &self,
            _state: &RunState,
            _call: Option<&(dyn ModelCallable + Send + Sync)>,
        ) -> Result<HashMap<String, Value>, AgentError> {
            Ok(HashMap::from([(self.output_key.to_string(), self.output_value.clone())]))
        }
    }

    struct FlakyAgent {
        id: AgentId,
        remaining_failures: AtomicU32,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn id(&self) -> &AgentId {
            &self.id
        }
        fn version(&self) -> &str {
            "v1"
        }
        fn policy(&self) -> &AgentPolicy {
            static POLICY: std::sync::OnceLock<AgentPolicy> = std::sync::OnceLock::new();
            POLICY.get_or_init(AgentPolicy::deterministic)
        }
        async fn run(
            &self,
            _state: &RunState,
            _call: Option<&(dyn ModelCallable + Send + Sync)>,
        ) -> Result<HashMap<String, Value>, AgentError> {
            let remaining = self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                if n == 0 { None } else { Some(n - 1) }
            });
            if remaining.is_ok() {
                Err(AgentError::Validation(vec!["simulated failure".to_string()]))
            } else {
                Ok(HashMap::from([("recovered".to_string(), Value::Bool(true))]))
            }
        }
    }

    fn node(agent: &str, next: Option<&str>) -> NodeSpec {
        NodeSpec {
            agent_id: AgentId::try_new(agent).unwrap(),
            required_inputs: Vec::new(),
            produced_outputs: Vec::new(),
            next: next.map(|n| NodeId::try_new(n).unwrap()),
            end: next.is_none(),
            on_fail: None,
            retry: None,
            budget: None,
        }
    }

    fn single_node_graph(agent: &str) -> GraphConfig {
        let entry = NodeId::try_new("start").unwrap();
        let mut nodes = HashMap::new();
        nodes.insert(entry.clone(), node(agent, None));
        GraphConfig { entry, nodes, max_node_visits: 8, max_run_tokens: None }
    }

    #[tokio::test]
    async fn single_deterministic_node_succeeds() {
        let agent_id = AgentId::try_new("summarizer").unwrap();
        let agents: HashMap<AgentId, Arc<dyn Agent>> = HashMap::from([(
            agent_id.clone(),
            Arc::new(DeterministicAgent {
                id: agent_id,
                output_key: "summary",
                output_value: Value::String("done".to_string()),
            }) as Arc<dyn Agent>,
        )]);
        let orchestrator = GraphOrchestrator::new(
            single_node_graph("summarizer"),
            agents,
            None,
            None,
            None,
            test_time_provider(),
        );
        let outcome = orchestrator.run(RunId::generate(), HashMap::new()).await.unwrap();
        match outcome {
            RunOutcome::Succeeded { final_state } => {
                assert_eq!(final_state.get("summary").unwrap().as_str(), Some("done"));
            }
            other => panic!("expected Succeeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_required_input_is_fatal() {
        let agent_id = AgentId::try_new("summarizer").unwrap();
        let entry = NodeId::try_new("start").unwrap();
        let mut spec = node("summarizer", None);
        spec.required_inputs = vec!["topic".to_string()];
        let mut nodes = HashMap::new();
        nodes.insert(entry.clone(), spec);
        let graph = GraphConfig { entry, nodes, max_node_visits: 8, max_run_tokens: None };

        let agents: HashMap<AgentId, Arc<dyn Agent>> = HashMap::from([(
            agent_id.clone(),
            Arc::new(DeterministicAgent {
                id: agent_id,
                output_key: "summary",
                output_value: Value::String("done".to_string()),
            }) as Arc<dyn Agent>,
        )]);
        let orchestrator = GraphOrchestrator::new(graph, agents, None, None, None, test_time_provider());
        let err = orchestrator.run(RunId::generate(), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingState { .. }));
    }

    #[tokio::test]
    async fn scenario_6_retry_and_on_fail_recovers_via_jump() {
        let flaky_id = AgentId::try_new("flaky").unwrap();
        let recovery_id = AgentId::try_new("extract_claims").unwrap();

        let entry = NodeId::try_new("start").unwrap();
        let recovery_node = NodeId::try_new("extract_claims").unwrap();

        let mut start_spec = node("flaky", None);
        start_spec.retry = Some(RetryPolicy { max_attempts: 2, backoff_seconds: 0 });
        start_spec.on_fail = Some(recovery_node.clone());

        let mut nodes = HashMap::new();
        nodes.insert(entry.clone(), start_spec);
        nodes.insert(recovery_node, node("extract_claims", None));
        let graph = GraphConfig { entry, nodes, max_node_visits: 8, max_run_tokens: None };

        let agents: HashMap<AgentId, Arc<dyn Agent>> = HashMap::from([
            (
                flaky_id.clone(),
                Arc::new(FlakyAgent {
                    id: flaky_id,
                    remaining_failures: AtomicU32::new(2),
                }) as Arc<dyn Agent>,
            ),
            (
                recovery_id.clone(),
                Arc::new(DeterministicAgent {
                    id: recovery_id,
                    output_key: "claims",
                    output_value: Value::Array(vec![]),
                }) as Arc<dyn Agent>,
            ),
        ]);

        let orchestrator = GraphOrchestrator::new(graph, agents, None, None, None, test_time_provider());
        let outcome = orchestrator.run(RunId::generate(), HashMap::new()).await.unwrap();
        match outcome {
            RunOutcome::Succeeded { final_state } => {
                assert!(final_state.contains_key("claims"));
                assert!(!final_state.contains_key("recovered"));
            }
            other => panic!("expected Succeeded via on_fail jump, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn node_visit_cap_raises_cycle_limit_exceeded() {
        let agent_id = AgentId::try_new("always_fails").unwrap();
        let entry = NodeId::try_new("loop_node").unwrap();
        let mut spec = node("always_fails", None);
        spec.on_fail = Some(entry.clone());
        let mut nodes = HashMap::new();
        nodes.insert(entry.clone(), spec);
        let graph = GraphConfig { entry, nodes, max_node_visits: 3, max_run_tokens: None };

        struct AlwaysFailsAgent(AgentId);
        #[async_trait]
        impl Agent for AlwaysFailsAgent {
            fn id(&self) -> &AgentId {
                &self.0
            }
            fn version(&self) -> &str {
                "v1"
            }
            fn policy(&self) -> &AgentPolicy {
                static POLICY: std::sync::OnceLock<AgentPolicy> = std::sync::OnceLock::new();
                POLICY.get_or_init(AgentPolicy::deterministic)
            }
            async fn run(
                &self,
                _state: &RunState,
                _call: Option<&(dyn ModelCallable + Send + Sync)>,
            ) -> Result<HashMap<String, Value>, AgentError> {
                Err(AgentError::Validation(vec!["always fails".to_string()]))
            }
        }

        let agents: HashMap<AgentId, Arc<dyn Agent>> =
            HashMap::from([(agent_id.clone(), Arc::new(AlwaysFailsAgent(agent_id)) as Arc<dyn Agent>)]);
        let orchestrator = GraphOrchestrator::new(graph, agents, None, None, None, test_time_provider());
        let err = orchestrator.run(RunId::generate(), HashMap::new()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::CycleLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn node_budget_cap_is_enforced() {
        let agent_id = AgentId::try_new("summarizer").unwrap();
        let entry = NodeId::try_new("start").unwrap();
        let mut spec = node("summarizer", None);
        spec.budget = Some(NodeBudget { max_tokens: Some(100), max_cost_cents: None });
        let mut nodes = HashMap::new();
        nodes.insert(entry.clone(), spec);
        let graph = GraphConfig { entry, nodes, max_node_visits: 8, max_run_tokens: None };

        let agents: HashMap<AgentId, Arc<dyn Agent>> = HashMap::from([(
            agent_id.clone(),
            Arc::new(DeterministicAgent {
                id: agent_id,
                output_key: "summary",
                output_value: Value::String("done".to_string()),
            }) as Arc<dyn Agent>,
        )]);
        let orchestrator = GraphOrchestrator::new(graph, agents, None, None, None, test_time_provider());

        let mut seed = HashMap::new();
        seed.insert(
            "_budget_used_tokens".to_string(),
            Value::from(TokenCount::new(500).into_inner()),
        );
        let err = orchestrator.run(RunId::generate(), seed).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::BudgetExceeded { .. }));
    }

    struct InMemoryCheckpointStore {
        saved: Mutex<Option<(NodeId, HashMap<String, Value>)>>,
    }

    #[async_trait]
    impl CheckpointStore for InMemoryCheckpointStore {
        async fn save_checkpoint(
            &self,
            _run_id: RunId,
            completed_node: &NodeId,
            state: &HashMap<String, Value>,
        ) -> anyhow::Result<()> {
            *self.saved.lock().unwrap() = Some((completed_node.clone(), state.clone()));
            Ok(())
        }

        async fn load_checkpoint(
            &self,
            _run_id: RunId,
        ) -> anyhow::Result<Option<(NodeId, HashMap<String, Value>)>> {
            Ok(self.saved.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn resume_continues_from_the_next_node_after_checkpoint() {
        let first_id = AgentId::try_new("first").unwrap();
        let second_id = AgentId::try_new("second").unwrap();
        let entry = NodeId::try_new("first").unwrap();
        let second_node = NodeId::try_new("second").unwrap();

        let mut nodes = HashMap::new();
        nodes.insert(entry.clone(), node("first", Some("second")));
        nodes.insert(second_node, node("second", None));
        let graph = GraphConfig { entry, nodes, max_node_visits: 8, max_run_tokens: None };

        let agents: HashMap<AgentId, Arc<dyn Agent>> = HashMap::from([
            (
                first_id.clone(),
                Arc::new(DeterministicAgent {
                    id: first_id,
                    output_key: "first_done",
                    output_value: Value::Bool(true),
                }) as Arc<dyn Agent>,
            ),
            (
                second_id.clone(),
                Arc::new(DeterministicAgent {
                    id: second_id,
                    output_key: "second_done",
                    output_value: Value::Bool(true),
                }) as Arc<dyn Agent>,
            ),
        ]);

        let checkpoints = Arc::new(InMemoryCheckpointStore { saved: Mutex::new(None) });
        let orchestrator = GraphOrchestrator::new(
            graph,
            agents,
            None,
            Some(checkpoints.clone() as Arc<dyn CheckpointStore>),
            None,
            test_time_provider(),
        );

        let run_id = RunId::generate();
        // Simulate an interruption: manually seed the checkpoint as if the
        // first node had already completed, then resume.
        checkpoints
            .save_checkpoint(run_id, &NodeId::try_new("first").unwrap(), &HashMap::from([(
                "first_done".to_string(),
                Value::Bool(true),
            )]))
            .await
            .unwrap();

        let outcome = orchestrator.resume(run_id).await.unwrap();
        match outcome {
            RunOutcome::Succeeded { final_state } => {
                assert!(final_state.contains_key("first_done"));
                assert!(final_state.contains_key("second_done"));
            }
            other => panic!("expected Succeeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn record_node_usage_accumulates_tokens_and_sets_degradation_at_cap() {
        let agent_id = AgentId::try_new("summarizer").unwrap();
        let mut graph = single_node_graph("summarizer");
        graph.max_run_tokens = Some(100);
        let orchestrator = GraphOrchestrator::new(
            graph,
            HashMap::from([(
                agent_id.clone(),
                Arc::new(DeterministicAgent {
                    id: agent_id,
                    output_key: "summary",
                    output_value: Value::Bool(true),
                }) as Arc<dyn Agent>,
            )]),
            None,
            None,
            None,
            test_time_provider(),
        );
        let mut state = RunState::new();

        orchestrator.record_node_usage(&mut state, None, TokenCount::new(20), TokenCount::new(20));
        assert_eq!(state.budget_used_tokens().into_inner(), 40);
        assert!(!state.degradation_active());

        orchestrator.record_node_usage(&mut state, None, TokenCount::new(40), TokenCount::new(0));
        assert_eq!(state.budget_used_tokens().into_inner(), 80);
        assert!(state.degradation_active());
    }
}
