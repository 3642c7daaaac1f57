//! Agent pack: a YAML-declared map of agent ids to runnable [`Agent`]
//! implementations, loaded by the CLI binary for `run-<scope>` commands.
//!
//! Domain-specific agent prompts (certification, dossier, lab, story) are
//! explicitly out of scope for the core; this loader is how the CLI wires
//! them in as data rather than baking any domain content into the crate.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::load_yaml;
use crate::agent::{Agent, AgentError, LlmAgent, ModelCallable};
use crate::domain::{AgentId, ModelId, Tier, UnitScore};
use crate::router::AgentPolicy;
use crate::state::RunState;

fn default_tier() -> u8 {
    1
}

fn default_max_output_tokens() -> u32 {
    1024
}

fn default_confidence_threshold() -> f64 {
    0.6
}

fn default_version() -> String {
    "1.0.0".to_string()
}

#[derive(Debug, Deserialize)]
struct AgentPolicySpec {
    #[serde(default = "default_tier")]
    preferred_tier: u8,
    #[serde(default)]
    min_tier: u8,
    #[serde(default = "default_max_output_tokens")]
    max_output_tokens: u32,
    #[serde(default)]
    permitted_local_models: Vec<ModelId>,
    #[serde(default)]
    permitted_frontier_models: Vec<ModelId>,
    #[serde(default = "default_confidence_threshold")]
    confidence_threshold: f64,
    #[serde(default)]
    required_citations: bool,
}

impl Default for AgentPolicySpec {
    fn default() -> Self {
        Self {
            preferred_tier: default_tier(),
            min_tier: 0,
            max_output_tokens: default_max_output_tokens(),
            permitted_local_models: Vec::new(),
            permitted_frontier_models: Vec::new(),
            confidence_threshold: default_confidence_threshold(),
            required_citations: false,
        }
    }
}

impl AgentPolicySpec {
    fn into_policy(self) -> AgentPolicy {
        AgentPolicy {
            preferred_tier: Tier::from_u8(self.preferred_tier),
            min_tier: Tier::from_u8(self.min_tier),
            max_output_tokens: self.max_output_tokens,
            permitted_local_models: self.permitted_local_models,
            permitted_frontier_models: self.permitted_frontier_models,
            confidence_threshold: UnitScore::clamp(self.confidence_threshold),
            required_citations: self.required_citations,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum AgentKind {
    /// Merges a fixed set of state keys without ever calling a model.
    /// Used for bookkeeping nodes (e.g. marking ingestion complete) that a
    /// graph needs but that carry no routing decision of their own.
    Deterministic {
        #[serde(default)]
        emits: serde_json::Map<String, Value>,
    },
    /// Backed by an [`LlmAgent`]: prompt assembly, model call, and the
    /// full JSON recovery pipeline.
    Llm {
        system_prompt: String,
        user_template: String,
        output_schema: Value,
    },
}

#[derive(Debug, Deserialize)]
struct AgentEntry {
    id: AgentId,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    policy: AgentPolicySpec,
    #[serde(flatten)]
    kind: AgentKind,
}

#[derive(Debug, Deserialize)]
struct AgentPackFile {
    agents: Vec<AgentEntry>,
}

struct StaticEmitAgent {
    id: AgentId,
    version: String,
    policy: AgentPolicy,
    emits: HashMap<String, Value>,
}

#[async_trait]
impl Agent for StaticEmitAgent {
    fn id(&self) -> &AgentId {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn policy(&self) -> &AgentPolicy {
        &self.policy
    }

    async fn run(
        &self,
        _state: &RunState,
        _call: Option<&(dyn ModelCallable + Send + Sync)>,
    ) -> Result<HashMap<String, Value>, AgentError> {
        Ok(self.emits.clone())
    }
}

/// Loads a YAML agent pack from `path`, building one [`Agent`]
/// implementation per declared entry.
///
/// # Errors
///
/// Returns an error if the file cannot be read or does not parse as a
/// valid agent pack.
pub fn load(path: &Path) -> Result<HashMap<AgentId, Arc<dyn Agent>>, super::ConfigLoadError> {
    let file: AgentPackFile = load_yaml(path)?;
    let mut agents: HashMap<AgentId, Arc<dyn Agent>> = HashMap::with_capacity(file.agents.len());
    for entry in file.agents {
        let policy = entry.policy.into_policy();
        let agent: Arc<dyn Agent> = match entry.kind {
            AgentKind::Deterministic { emits } => Arc::new(StaticEmitAgent {
                id: entry.id.clone(),
                version: entry.version,
                policy,
                emits: emits.into_iter().collect(),
            }),
            AgentKind::Llm {
                system_prompt,
                user_template,
                output_schema,
            } => Arc::new(LlmAgent::new(
                entry.id.clone(),
                entry.version,
                policy,
                system_prompt,
                user_template,
                output_schema,
            )),
        };
        agents.insert(entry.id, agent);
    }
    Ok(agents)
}
