//! Agent Runtime: the per-node agent contract, prompt assembly, and the
//! multi-stage JSON recovery pipeline described in spec §4.6.
//!
//! Grounded on the teacher's capability-based agent trait (an agent is a
//! value satisfying an interface, not a base class) and on
//! `wasm_module_validator.rs`'s preference for a hand-rolled structural
//! validator over a full JSON Schema engine.

pub mod json_repair;

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::adapters::{ModelApiError, ModelCallOutcome};
use crate::domain::AgentId;
use crate::router::AgentPolicy;
use crate::state::RunState;

/// Failures raised while running an agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A user-template placeholder referenced a run-state key that was
    /// never set — a graph-design error, fatal to the run.
    #[error("missing state key referenced by prompt template: {key}")]
    MissingState {
        /// The unresolved placeholder name.
        key: String,
    },
    /// The underlying model call failed.
    #[error(transparent)]
    Model(#[from] ModelApiError),
    /// The model's output still failed schema validation after every
    /// recovery stage.
    #[error("output failed validation after recovery: {0:?}")]
    Validation(Vec<String>),
}

/// A callable over a chosen model adapter, supplied by the orchestrator
/// (typically via [`crate::router::ModelRouter::get_callable`]). Kept as
/// its own trait so the Agent Runtime doesn't need to depend on the
/// router's concrete selection machinery to be tested.
#[async_trait]
pub trait ModelCallable: Send + Sync {
    /// Invokes the underlying model with a system/user message pair.
    async fn call(&self, system: &str, user: &str) -> Result<ModelCallOutcome, ModelApiError>;
}

/// The capability set every agent satisfies (design note §9): an
/// identity, a policy, and a `run` function. Deterministic agents
/// implement `run` directly without ever touching `call`.
#[async_trait]
pub trait Agent: Send + Sync {
    /// This agent's stable identifier.
    fn id(&self) -> &AgentId;
    /// This agent's version string.
    fn version(&self) -> &str;
    /// This agent's routing policy.
    fn policy(&self) -> &AgentPolicy;
    /// Runs the agent against the current run state, returning the delta
    /// to merge. `call` is `None` for deterministic (tier-0) agents.
    async fn run(
        &self,
        state: &RunState,
        call: Option<&(dyn ModelCallable + Send + Sync)>,
    ) -> Result<HashMap<String, Value>, AgentError>;
}

const MAX_RECOVERY_ATTEMPTS: usize = 3;

/// An LLM-backed agent: system prompt, templated user prompt, and
/// input/output schemas, running the full prompt-assembly → call →
/// extract → repair → validate → recover pipeline.
pub struct LlmAgent {
    id: AgentId,
    version: String,
    policy: AgentPolicy,
    system_prompt: String,
    user_template: String,
    output_schema: Value,
}

impl LlmAgent {
    /// Builds an LLM agent. `output_schema` is a JSON Schema document
    /// checked by the lightweight structural validator (§4.6.1) — the
    /// input schema is validated by the orchestrator's input-key check,
    /// not re-derived here.
    #[must_use]
    pub fn new(
        id: AgentId,
        version: impl Into<String>,
        policy: AgentPolicy,
        system_prompt: impl Into<String>,
        user_template: impl Into<String>,
        output_schema: Value,
    ) -> Self {
        Self {
            id,
            version: version.into(),
            policy,
            system_prompt: system_prompt.into(),
            user_template: user_template.into(),
            output_schema,
        }
    }

    fn placeholder_pattern() -> &'static Regex {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        PATTERN.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("valid placeholder pattern"))
    }

    fn assemble_user_prompt(&self, state: &RunState) -> Result<String, AgentError> {
        let mut missing: Option<String> = None;
        let rendered = Self::placeholder_pattern().replace_all(&self.user_template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match state.get(key) {
                Some(value) => render_placeholder_value(value),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(key) => Err(AgentError::MissingState { key }),
            None => Ok(rendered.into_owned()),
        }
    }

    fn parse_and_validate(&self, raw: &str) -> Result<Value, Vec<String>> {
        let Some(candidate) = json_repair::extract_candidate(raw) else {
            return Err(vec!["no JSON object or array found in model output".to_string()]);
        };
        let repaired = json_repair::repair_json(candidate);
        let value: Value =
            serde_json::from_str(&repaired).map_err(|e| vec![format!("JSON parse error: {e}")])?;

        let mut errors = validate_against_schema(&self.output_schema, &value);
        if self.policy.required_citations {
            errors.extend(check_citations(&value));
        }
        if errors.is_empty() { Ok(value) } else { Err(errors) }
    }
}

#[async_trait]
impl Agent for LlmAgent {
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
        state: &RunState,
        call: Option<&(dyn ModelCallable + Send + Sync)>,
    ) -> Result<HashMap<String, Value>, AgentError> {
        let user_prompt = self.assemble_user_prompt(state)?;
        let Some(call) = call else {
            return Err(AgentError::Model(ModelApiError::permanent(
                "no model callable supplied for an LLM agent",
            )));
        };

        let outcome = call.call(&self.system_prompt, &user_prompt).await?;
        match self.parse_and_validate(&outcome.content) {
            Ok(value) => Ok(to_delta_map(value)),
            Err(mut errors) => {
                let mut raw = outcome.content;
                for attempt in 1..=MAX_RECOVERY_ATTEMPTS {
                    let repair_prompt = build_repair_prompt(&raw, &self.output_schema, &errors, attempt);
                    let retry = call.call(&self.system_prompt, &repair_prompt).await?;
                    match self.parse_and_validate(&retry.content) {
                        Ok(value) => return Ok(to_delta_map(value)),
                        Err(e) => {
                            errors = e;
                            raw = retry.content;
                        }
                    }
                }
                Err(AgentError::Validation(errors))
            }
        }
    }
}

fn render_placeholder_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_delta_map(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => HashMap::from([("output".to_string(), other)]),
    }
}

/// Builds the stage-6/7 recovery prompt: the schema, the prior output, the
/// validation errors, and sternness that escalates with each attempt.
fn build_repair_prompt(raw: &str, schema: &Value, errors: &[String], attempt: usize) -> String {
    let sternness = match attempt {
        1 => "Your previous response did not match the required schema.",
        2 => "This is the second correction attempt. Return only valid JSON matching the schema exactly.",
        _ => "FINAL ATTEMPT. Return ONLY a single JSON value matching the schema below — no prose, no code fences.",
    };
    format!(
        "{sternness}\n\nSchema:\n{}\n\nYour previous output:\n{raw}\n\nValidation errors:\n{}\n\nReturn corrected JSON only.",
        serde_json::to_string_pretty(schema).unwrap_or_default(),
        errors.join("; "),
    )
}

/// Lightweight structural validator (§4.6.1): checks `type`, `required`,
/// `properties`, and `items` against a JSON Schema-shaped document,
/// without implementing the full JSON Schema specification.
#[must_use]
pub fn validate_against_schema(schema: &Value, value: &Value) -> Vec<String> {
    validate_at(schema, value, "$")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(schema_obj) = schema.as_object() else {
        return errors;
    };

    if let Some(expected_type) = schema_obj.get("type").and_then(Value::as_str) {
        if !type_matches(expected_type, value) {
            errors.push(format!(
                "{path}: expected type '{expected_type}', got '{}'",
                type_name(value)
            ));
            return errors;
        }
    }

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        if let Some(object) = value.as_object() {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    errors.push(format!("{path}: missing required field '{key}'"));
                }
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        if let Some(object) = value.as_object() {
            for (key, sub_schema) in properties {
                if let Some(sub_value) = object.get(key) {
                    errors.extend(validate_at(sub_schema, sub_value, &format!("{path}.{key}")));
                }
            }
        }
    }

    if let Some(items_schema) = schema_obj.get("items") {
        if let Some(array) = value.as_array() {
            for (idx, item) in array.iter().enumerate() {
                errors.extend(validate_at(items_schema, item, &format!("{path}[{idx}]")));
            }
        }
    }

    errors
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Required-citations enforcement: every object inside any top-level
/// array field must carry a non-empty `citations` array.
fn check_citations(value: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    let Some(object) = value.as_object() else {
        return errors;
    };
    for (key, field) in object {
        let Some(items) = field.as_array() else {
            continue;
        };
        for (idx, item) in items.iter().enumerate() {
            if item.is_object() {
                let has_citations = item
                    .get("citations")
                    .and_then(Value::as_array)
                    .is_some_and(|c| !c.is_empty());
                if !has_citations {
                    errors.push(format!("{key}[{idx}] is missing a non-empty citations list"));
                }
            }
        }
    }
    errors
}
