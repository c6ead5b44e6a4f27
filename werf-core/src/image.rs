//! Built-image model: persisted stage descriptions, the label wire format,
//! and the abstract service spec stages populate before a commit.

use crate::config::DockerInstructionsConfig;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Label carrying the project head commit on every built stage.
pub const PROJECT_REPO_COMMIT_LABEL: &str = "werf-project-repo-commit";

/// `;`-joined `tmp_dir` mountpoints.
pub const MOUNT_TMP_DIR_LABEL: &str = "werf-mount-tmp-dir";

/// `;`-joined `build_dir` mountpoints.
pub const MOUNT_BUILD_DIR_LABEL: &str = "werf-mount-build-dir";

/// Prefix for custom mounts; the label key encodes the host `from` path.
pub const MOUNT_CUSTOM_DIR_LABEL_PREFIX: &str = "werf-mount-custom-dir-";

/// Prefix for per-import checksum labels, suffixed with the import id.
pub const IMPORT_CHECKSUM_LABEL_PREFIX: &str = "werf-import-checksum-";

/// Prefix for per-git-mapping commit labels, suffixed with the mapping id.
pub const GIT_MAPPING_LABEL_PREFIX: &str = "werf-git-";

/// Encode a custom mount `from` path into its label-key form (`/` → `--`).
pub fn encode_custom_mount_from(from: &str) -> String {
    from.replace('/', "--")
}

/// Decode the label-key form back into a path.
///
/// `--` always decodes to `/`; a `from` path containing a literal `--` is
/// corrupted by the round trip. Known limitation of the label format.
pub fn decode_custom_mount_from(encoded: &str) -> String {
    encoded.replace("--", "/")
}

/// Identity of a built stage inside the stages storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageId {
    /// The stage digest the description is keyed under.
    pub digest: String,
    /// Epoch-millis creation marker; orders same-digest builds in time.
    pub unique_id: i64,
}

impl StageId {
    /// A fresh id for `digest`, stamped with the current time.
    pub fn new(digest: impl Into<String>) -> Self {
        Self { digest: digest.into(), unique_id: Utc::now().timestamp_millis() }
    }

    /// Total order over same-digest builds.
    pub fn unique_id_as_time(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.unique_id).single().unwrap_or_else(Utc::now)
    }
}

/// Inspectable facts about a built image.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Stage image name in the stages repo.
    pub name: String,
    /// Runtime image id.
    pub id: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// RFC-3339 creation timestamp.
    #[serde(default)]
    pub created: String,
}

/// The persisted record of a built stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescription {
    pub stage_id: StageId,
    pub info: ImageInfo,
}

/// An inline-dockerfile build request carried on a [`StageImage`].
#[derive(Debug, Clone, Default)]
pub struct DockerfileBuild {
    pub content: Vec<u8>,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
}

/// The abstract service/container spec a stage's `prepare_image` populates.
///
/// Stages only describe what the runtime must do: commands to run, labels to
/// commit, host volumes to honor. Actual builds happen later, in the
/// conveyor's runtime execution step.
#[derive(Debug, Clone, Default)]
pub struct StageImage {
    /// Base image the stage container starts from.
    pub from_image: Option<String>,
    /// Pipeline-internal commands run before the user's commands.
    pub service_run_commands: Vec<String>,
    /// User commands for this stage.
    pub run_commands: Vec<String>,
    /// Labels committed onto the produced image.
    pub labels: BTreeMap<String, String>,
    /// `host:container` volume bindings the runtime must honor.
    pub volumes: Vec<String>,
    /// Docker-style config directives committed onto the produced image.
    pub instructions: DockerInstructionsConfig,
    /// When set, the stage is produced by an inline-dockerfile build instead
    /// of the from/run/commit flow.
    pub dockerfile: Option<DockerfileBuild>,
}

impl StageImage {
    pub fn add_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.labels.insert(key.into(), value.into());
    }

    pub fn add_volume(&mut self, from: impl Into<String>, to: impl Into<String>) {
        self.volumes.push(format!("{}:{}", from.into(), to.into()));
    }

    pub fn add_service_run_command(&mut self, command: impl Into<String>) {
        self.service_run_commands.push(command.into());
    }

    /// All commands in execution order: service first, then user commands.
    pub fn all_run_commands(&self) -> Vec<String> {
        self.service_run_commands.iter().chain(self.run_commands.iter()).cloned().collect()
    }
}
