//! Layered configuration for the router, dispatcher, and graph orchestrator.
//!
//! Configuration is loaded from YAML files into typed structs, validated once
//! at load time, and swapped atomically on `reload_config` without replacing
//! the adapters or providers already wired into the running process.

pub mod agent_pack;
pub mod graph;
pub mod router;

pub use graph::{GraphConfig, GraphConfigError, NodeBudget, NodeSpec, RetryPolicy};
pub use router::{
    EscalationCriteria, ProviderSpec, RouterConfig, RouterConfigError, ScoreWeights,
    SelectionStrategy, TierConfig,
};

use std::path::Path;

use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors shared by every YAML-backed config loader.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// The file could not be read from disk.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The file's contents were not valid YAML for the target type.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
}

/// Loads and deserializes a YAML config file into `T`.
pub(crate) fn load_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigLoadError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|source| ConfigLoadError::Parse {
        path: path.display().to_string(),
        source,
    })
}
