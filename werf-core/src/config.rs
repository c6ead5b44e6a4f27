//! Declarative project configuration consumed by the stage pipeline.
//!
//! Parsing configuration files is the job of an outer surface; the pipeline
//! only defines the shapes it plans stages from, plus persistent build
//! settings in the usual load/save style.

use crate::error::{Result, WerfError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A whole project: a set of named images built from one source tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Project name, scopes the stages storage.
    pub project: String,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
}

/// One image assembled from the fixed stage sequence.
///
/// `name` is empty for the project's nameless image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub name: String,
    /// Base image reference for the `from` stage.
    #[serde(default)]
    pub from: Option<String>,
    /// Manual cache-busting version folded into the `from` stage digest.
    #[serde(default)]
    pub from_cache_version: Option<String>,
    #[serde(default)]
    pub git: Vec<GitMappingConfig>,
    #[serde(default)]
    pub mounts: Vec<MountConfig>,
    #[serde(default)]
    pub imports: Vec<ImportConfig>,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub docker: DockerInstructionsConfig,
    /// When set, the image is the degenerate single-stage inline dockerfile.
    #[serde(default)]
    pub dockerfile: Option<DockerfileConfig>,
}

/// Kind of a declared mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountType {
    TmpDir,
    BuildDir,
    CustomDir,
}

/// A mount declared in the project config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    #[serde(rename = "type")]
    pub mount_type: MountType,
    /// Host path, only meaningful for `custom_dir`.
    #[serde(default)]
    pub from: String,
    /// Mountpoint inside the image.
    pub to: String,
}

/// Binding of one source repository (optionally path-filtered) to an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GitMappingConfig {
    /// Name of the configured repository this mapping reads from.
    pub name: String,
    /// Source directory inside the repository.
    #[serde(default = "default_add")]
    pub add: String,
    /// Destination directory inside the image.
    pub to: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

fn default_add() -> String {
    "/".to_string()
}

/// A cross-image file-tree import.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportConfig {
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub artifact_name: String,
    /// Source stage name; empty means the source image's last stage.
    #[serde(default)]
    pub stage: String,
    pub add: String,
    pub to: String,
    /// Target user stage this import lands before/after. Exactly one is set.
    #[serde(default)]
    pub before: String,
    #[serde(default)]
    pub after: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
}

impl ImportConfig {
    /// The source image: named image, or artifact when no image is set.
    pub fn source_name(&self) -> &str {
        if !self.image_name.is_empty() {
            &self.image_name
        } else {
            &self.artifact_name
        }
    }
}

/// Shell commands for the four user stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default)]
    pub before_install: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub before_setup: Vec<String>,
    #[serde(default)]
    pub setup: Vec<String>,
    #[serde(default)]
    pub before_install_cache_version: Option<String>,
    #[serde(default)]
    pub install_cache_version: Option<String>,
    #[serde(default)]
    pub before_setup_cache_version: Option<String>,
    #[serde(default)]
    pub setup_cache_version: Option<String>,
}

/// Docker-style config directives applied at the `dockerInstructions` stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerInstructionsConfig {
    #[serde(default)]
    pub volume: Vec<String>,
    #[serde(default)]
    pub expose: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub label: BTreeMap<String, String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub healthcheck: String,
}

impl DockerInstructionsConfig {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// The degenerate single-stage path: the whole image as an inline dockerfile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DockerfileConfig {
    pub content: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    /// Content digest of the build context, computed by the caller.
    #[serde(default)]
    pub context_digest: String,
}

/// Persistent build settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSettings {
    /// Upper bound on images built concurrently.
    pub max_parallel_builds: usize,
    /// Repository prefix for stage image names.
    pub stages_repo: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self { max_parallel_builds: 4, stages_repo: "werf-stages".to_string() }
    }
}

impl BuildSettings {
    /// Load settings from disk, falling back to defaults when absent.
    pub fn load(path: &PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| WerfError::UserConfig {
            reason: format!("failed to read settings {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&content).map_err(|e| WerfError::UserConfig {
            reason: format!("failed to parse settings {}: {}", path.display(), e),
        })
    }

    /// Save settings to disk.
    pub fn save(&self, path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WerfError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| WerfError::io(path.clone(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_source_name() {
        let mut import = ImportConfig { image_name: "builder".into(), ..Default::default() };
        assert_eq!(import.source_name(), "builder");

        import.image_name.clear();
        import.artifact_name = "assets".into();
        assert_eq!(import.source_name(), "assets");
    }

    #[test]
    fn test_mount_type_serde_names() {
        let m: MountConfig =
            serde_json::from_str(r#"{"type": "tmp_dir", "to": "/tmp/foo"}"#).unwrap();
        assert_eq!(m.mount_type, MountType::TmpDir);
        assert!(m.from.is_empty());
    }

    #[test]
    fn test_build_settings_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = BuildSettings { max_parallel_builds: 2, ..Default::default() };
        settings.save(&path).unwrap();

        let loaded = BuildSettings::load(&path).unwrap();
        assert_eq!(loaded.max_parallel_builds, 2);
        assert_eq!(loaded.stages_repo, "werf-stages");
    }
}
