//! Graph definition configuration: an ordered set of node specs loaded from
//! YAML, immutable once the run starts.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::load_yaml;
use crate::domain::{AgentId, NodeId};

/// Retry policy for a single node's agent call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Seconds to sleep between attempts.
    pub backoff_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_seconds: 0,
        }
    }
}

/// Optional per-node budget cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct NodeBudget {
    /// Maximum tokens this node may consume.
    pub max_tokens: Option<u64>,
    /// Maximum cost, in cents, this node may consume.
    pub max_cost_cents: Option<rust_decimal::Decimal>,
}

/// A single node in the graph: which agent runs, what it needs, what it
/// produces, and where execution goes next.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Agent identifier invoked at this node.
    pub agent_id: AgentId,
    /// Run-state keys that must exist before this node executes.
    #[serde(default)]
    pub required_inputs: Vec<String>,
    /// Run-state keys this node must populate before advancing.
    #[serde(default)]
    pub produced_outputs: Vec<String>,
    /// The next node to execute, if any.
    #[serde(default)]
    pub next: Option<NodeId>,
    /// Whether this node terminates the run.
    #[serde(default)]
    pub end: bool,
    /// Node to jump to on non-retryable failure.
    #[serde(default)]
    pub on_fail: Option<NodeId>,
    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Per-node budget cap.
    #[serde(default)]
    pub budget: Option<NodeBudget>,
}

/// An immutable, ordered graph of nodes, keyed by `NodeId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// The entry node's id.
    pub entry: NodeId,
    /// All nodes, keyed by id.
    pub nodes: HashMap<NodeId, NodeSpec>,
    /// Per-run node-visit cap before `GraphError::CycleLimitExceeded`.
    #[serde(default = "default_max_node_visits")]
    pub max_node_visits: u32,
    /// Per-run token cap; at 80% of this total the orchestrator sets
    /// `_degradation_active` (spec §4.7 step 2). `None` disables the
    /// degradation signal entirely.
    #[serde(default)]
    pub max_run_tokens: Option<u64>,
}

fn default_max_node_visits() -> u32 {
    8
}

/// Errors raised while validating a loaded `GraphConfig`.
#[derive(Debug, Error)]
pub enum GraphConfigError {
    /// The config file could not be loaded or parsed.
    #[error(transparent)]
    Load(#[from] super::ConfigLoadError),
    /// The declared entry node is not present in `nodes`.
    #[error("entry node {0} is not defined")]
    MissingEntry(NodeId),
    /// A node's `next` pointer references an undefined node.
    #[error("node {node} points to undefined next node {target}")]
    DanglingNext {
        /// The node with the dangling pointer.
        node: NodeId,
        /// The undefined target.
        target: NodeId,
    },
    /// A node's `on_fail` pointer references an undefined node.
    #[error("node {node} points to undefined on_fail node {target}")]
    DanglingOnFail {
        /// The node with the dangling pointer.
        node: NodeId,
        /// The undefined target.
        target: NodeId,
    },
    /// A non-terminal node declared neither `next` nor `end`.
    #[error("node {0} is non-terminal but declares no next node")]
    NoExit(NodeId),
}

impl GraphConfig {
    /// Loads a `GraphConfig` from a YAML file and validates it.
    pub fn load(path: &Path) -> Result<Self, GraphConfigError> {
        let config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates that the entry node exists and every `next`/`on_fail`
    /// pointer resolves to a defined node.
    pub fn validate(&self) -> Result<(), GraphConfigError> {
        if !self.nodes.contains_key(&self.entry) {
            return Err(GraphConfigError::MissingEntry(self.entry.clone()));
        }

        for (id, spec) in &self.nodes {
            if let Some(next) = &spec.next {
                if !self.nodes.contains_key(next) {
                    return Err(GraphConfigError::DanglingNext {
                        node: id.clone(),
                        target: next.clone(),
                    });
                }
            } else if !spec.end {
                return Err(GraphConfigError::NoExit(id.clone()));
            }

            if let Some(on_fail) = &spec.on_fail {
                if !self.nodes.contains_key(on_fail) {
                    return Err(GraphConfigError::DanglingOnFail {
                        node: id.clone(),
                        target: on_fail.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
