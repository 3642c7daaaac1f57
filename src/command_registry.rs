//! Tier-0 deterministic dispatch: regex and JSON-payload command matching
//! with confidence fixed at `1.0`. No model call is ever made at this tier.

use std::collections::HashMap;

use regex::Regex;
use serde_json::Value;

use crate::domain::UnitScore;

/// A single registered command pattern.
pub struct CommandEntry {
    regex: Regex,
    action: String,
    target: String,
    description: String,
}

/// The outcome of a successful tier-0 match.
#[derive(Debug, Clone)]
pub struct CommandMatch {
    /// The action to execute, e.g. `"execute_graph"`.
    pub action: String,
    /// The graph/target identified by the command, e.g. `"run_cert"`.
    pub target: String,
    /// Named capture groups from the regex, or the parsed JSON payload.
    pub args: HashMap<String, String>,
    /// Always `1.0`: tier-0 matches are deterministic.
    pub confidence: UnitScore,
}

/// Registers and matches tier-0 slash commands and JSON command payloads.
pub struct CommandRegistry {
    entries: Vec<CommandEntry>,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_default_commands()
    }
}

impl CommandRegistry {
    /// Builds an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Builds a registry pre-populated with the standard pipeline commands:
    /// `/cert`, `/dossier`, `/story`, `/lab`, `/status`, `/help`.
    #[must_use]
    pub fn with_default_commands() -> Self {
        let mut registry = Self::new();
        registry.register(
            r"^/cert\s+(?P<cert_id>\S+)$",
            "execute_graph",
            "run_cert",
            "Run the certification graph for a given certification id",
        );
        registry.register(
            r"^/dossier\s+(?P<id>\S+)$",
            "execute_graph",
            "run_dossier",
            "Run the dossier graph for a given entity id",
        );
        registry.register(
            r"^/story\s+(?P<world_id>\S+)$",
            "execute_graph",
            "run_story",
            "Run the story graph for a given world id",
        );
        registry.register(
            r"^/lab\s+(?P<suite_id>\S+)$",
            "execute_graph",
            "run_lab",
            "Run the lab graph for a given test suite id",
        );
        registry.register(r"^/status$", "show_status", "status", "Show run/router status");
        registry.register(r"^/help$", "show_help", "help", "List available commands");
        registry
    }

    /// Registers a new `(regex, action, target, description)` entry. Patterns
    /// are tried in registration order; the first to match wins.
    ///
    /// # Panics
    ///
    /// Panics if `pattern` is not a valid regex — command patterns are
    /// compiled once at registry construction, never from user input.
    pub fn register(
        &mut self,
        pattern: &str,
        action: impl Into<String>,
        target: impl Into<String>,
        description: impl Into<String>,
    ) {
        let regex = Regex::new(pattern).expect("command pattern must be a valid regex");
        self.entries.push(CommandEntry {
            regex,
            action: action.into(),
            target: target.into(),
            description: description.into(),
        });
    }

    /// Attempts to match `input` against every registered pattern in order,
    /// then falls back to JSON-command parsing.
    #[must_use]
    pub fn match_input(&self, input: &str) -> Option<CommandMatch> {
        let trimmed = input.trim();

        for entry in &self.entries {
            if let Some(captures) = entry.regex.captures(trimmed) {
                let mut args = HashMap::new();
                for name in entry.regex.capture_names().flatten() {
                    if let Some(value) = captures.name(name) {
                        args.insert(name.to_string(), value.as_str().to_string());
                    }
                }
                return Some(CommandMatch {
                    action: entry.action.clone(),
                    target: entry.target.clone(),
                    args,
                    confidence: UnitScore::clamp(1.0),
                });
            }
        }

        self.match_json(trimmed)
    }

    /// If `input` parses as a JSON object carrying a `command` field, builds
    /// a synthetic match with the remaining fields as string-coerced args.
    fn match_json(&self, input: &str) -> Option<CommandMatch> {
        let value: Value = serde_json::from_str(input).ok()?;
        let object = value.as_object()?;
        let command = object.get("command")?.as_str()?.to_string();

        let args = object
            .iter()
            .filter(|(key, _)| key.as_str() != "command")
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect();

        Some(CommandMatch {
            action: "execute_graph".to_string(),
            target: command,
            args,
            confidence: UnitScore::clamp(1.0),
        })
    }

    /// Lists every registered command's action/target/description, for the
    /// `/help` handler and the dashboard.
    #[must_use]
    pub fn describe(&self) -> Vec<(String, String, String)> {
        self.entries
            .iter()
            .map(|e| (e.action.clone(), e.target.clone(), e.description.clone()))
            .collect()
    }
}
