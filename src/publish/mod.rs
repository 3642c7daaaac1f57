//! Publish renderer stub (spec §6.1): a minimal collaborator the
//! orchestrator's terminal-node step can call to land a manifest and
//! artifact list under `publish/out/<scope_type>/<scope_id>/<version>/`.
//! Domain-specific Markdown/CSV rendering is out of scope; this only proves
//! the seam exists and is real.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DeltaId, ScopeId, ScopeType, SnapshotId};

/// A manifest describing one publish: which snapshot/delta it was built
/// from, and a version string per the scope's versioning scheme (spec §6:
/// semver for certifications, dated tags for topics, `suite-id-<hash>` for
/// labs, zero-padded episode numbers for stories).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// Scope this publish targets.
    pub scope_type: ScopeType,
    /// Scope instance id.
    pub scope_id: ScopeId,
    /// Version string, meaning depends on `scope_type`.
    pub version: String,
    /// Snapshot this publish was rendered from.
    pub snapshot_id: SnapshotId,
    /// Delta applied since the previous publish, if any.
    pub delta_id: Option<DeltaId>,
}

/// A single rendered artifact's name and raw bytes.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// File name relative to the publish directory, e.g. `"report.json"`.
    pub name: String,
    /// Raw artifact content.
    pub content: Vec<u8>,
}

/// Failure writing a manifest or artifact.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The underlying filesystem write failed.
    #[error("publish I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The manifest could not be serialized.
    #[error("manifest serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where published manifests and artifacts land. Implemented by a no-op/
/// in-memory test double and a filesystem implementation.
pub trait PublishSink: Send + Sync {
    /// Writes the manifest for one publish.
    fn write_manifest(&self, manifest: &Manifest) -> Result<(), PublishError>;

    /// Writes a single artifact belonging to `manifest`.
    fn write_artifact(&self, manifest: &Manifest, artifact: &Artifact) -> Result<(), PublishError>;
}

fn publish_dir(root: &Path, manifest: &Manifest) -> PathBuf {
    let scope_type = match manifest.scope_type {
        ScopeType::Certification => "certification",
        ScopeType::Topic => "topic",
        ScopeType::Lab => "lab",
        ScopeType::Story => "story",
    };
    root.join(scope_type).join(manifest.scope_id.to_string()).join(&manifest.version)
}

/// Writes manifests and artifacts under `publish/out/<scope_type>/<scope_id>/<version>/`.
pub struct FilesystemPublishSink {
    root: PathBuf,
}

impl FilesystemPublishSink {
    /// Creates a sink rooted at `root` (typically `publish/out`).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PublishSink for FilesystemPublishSink {
    fn write_manifest(&self, manifest: &Manifest) -> Result<(), PublishError> {
        let dir = publish_dir(&self.root, manifest);
        std::fs::create_dir_all(&dir)?;
        let body = serde_json::to_vec_pretty(manifest)?;
        std::fs::write(dir.join("manifest.json"), body)?;
        Ok(())
    }

    fn write_artifact(&self, manifest: &Manifest, artifact: &Artifact) -> Result<(), PublishError> {
        let dir = publish_dir(&self.root, manifest);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(&artifact.name), &artifact.content)?;
        Ok(())
    }
}

/// In-memory sink for tests: records every manifest/artifact written
/// instead of touching the filesystem.
#[derive(Default)]
pub struct InMemoryPublishSink {
    manifests: Mutex<Vec<Manifest>>,
    artifacts: Mutex<Vec<(String, Artifact)>>,
}

impl InMemoryPublishSink {
    /// Creates an empty in-memory sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every manifest written so far.
    #[must_use]
    pub fn manifests(&self) -> Vec<Manifest> {
        self.manifests.lock().expect("sink mutex poisoned").clone()
    }

    /// Returns the names of artifacts written under `version`.
    #[must_use]
    pub fn artifact_names(&self, version: &str) -> Vec<String> {
        self.artifacts
            .lock()
            .expect("sink mutex poisoned")
            .iter()
            .filter(|(v, _)| v == version)
            .map(|(_, artifact)| artifact.name.clone())
            .collect()
    }
}

impl PublishSink for InMemoryPublishSink {
    fn write_manifest(&self, manifest: &Manifest) -> Result<(), PublishError> {
        self.manifests.lock().expect("sink mutex poisoned").push(manifest.clone());
        Ok(())
    }

    fn write_artifact(&self, manifest: &Manifest, artifact: &Artifact) -> Result<(), PublishError> {
        self.artifacts
            .lock()
            .expect("sink mutex poisoned")
            .push((manifest.version.clone(), artifact.clone_boxed()));
        Ok(())
    }
}

impl Artifact {
    fn clone_boxed(&self) -> Artifact {
        Artifact { name: self.name.clone(), content: self.content.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(version: &str) -> Manifest {
        Manifest {
            scope_type: ScopeType::Certification,
            scope_id: ScopeId::try_new("az-104").unwrap(),
            version: version.to_string(),
            snapshot_id: SnapshotId::generate(),
            delta_id: None,
        }
    }

    #[test]
    fn in_memory_sink_records_manifests_and_artifacts() {
        let sink = InMemoryPublishSink::new();
        let manifest = sample_manifest("1.0.0");
        sink.write_manifest(&manifest).unwrap();
        sink.write_artifact(
            &manifest,
            &Artifact { name: "report.json".to_string(), content: b"{}".to_vec() },
        )
        .unwrap();

        assert_eq!(sink.manifests().len(), 1);
        assert_eq!(sink.artifact_names("1.0.0"), vec!["report.json".to_string()]);
    }

    #[test]
    fn filesystem_sink_writes_manifest_and_artifact_under_scoped_path() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FilesystemPublishSink::new(dir.path());
        let manifest = sample_manifest("2026.07.28");
        sink.write_manifest(&manifest).unwrap();
        sink.write_artifact(
            &manifest,
            &Artifact { name: "artifacts.json".to_string(), content: b"[]".to_vec() },
        )
        .unwrap();

        let expected = dir.path().join("certification").join("az-104").join("2026.07.28");
        assert!(expected.join("manifest.json").exists());
        assert!(expected.join("artifacts.json").exists());
    }
}
