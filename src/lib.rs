//! # triage-core
//!
//! The cognitive routing and graph orchestration core of a multi-agent
//! content pipeline. Given a workload expressed as a directed graph of
//! agent invocations, the core decides which model tier serves each node,
//! how to recover from malformed structured output, and how state flows
//! between nodes under budget, concurrency, and failure constraints.
//!
//! Three coupled subsystems do the hardest work:
//!
//! - [`orchestrator`]: state-carrying execution of a node chain with
//!   retries, `on_fail` jumps, per-node budget caps, and checkpoint/resume.
//! - [`dispatcher`] + [`router`]: a four-tier escalation chain (regex →
//!   micro classifier → light reasoner → frontier provider pool) with
//!   composite scoring, safety bypass, and provider failover.
//! - [`agent`]: prompt assembly, response extraction, and the three-stage
//!   JSON recovery pipeline that backs the agent contract.
//!
//! Everything else — [`adapters`], [`providers`], [`command_registry`],
//! [`config`], [`state`], [`telemetry`], [`persistence`], [`publish`], and
//! [`database`] — exists to support those three.

pub mod adapters;
pub mod agent;
pub mod command_registry;
pub mod config;
pub mod database;
pub mod dispatcher;
pub mod domain;
pub mod orchestrator;
pub mod persistence;
pub mod providers;
pub mod publish;
pub mod router;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time_provider;

pub use agent::{Agent, AgentError, LlmAgent, ModelCallable};
pub use command_registry::{CommandMatch, CommandRegistry};
pub use config::{GraphConfig, RouterConfig};
pub use dispatcher::{DispatchError, DispatchOutcome, TieredDispatcher};
pub use orchestrator::{GraphOrchestrator, OrchestratorError, RunOutcome};
pub use router::ModelRouter;
pub use state::RunState;
