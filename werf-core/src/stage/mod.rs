//! The stage pipeline: the fixed stage sequence, the immutable stage plan,
//! and the operations the conveyor drives per stage.
//!
//! A [`Stage`] is built once per (image, stage name) and never mutated; the
//! conveyor records digests and resolved images in its own bookkeeping as it
//! advances. Behavior differences between stage kinds live in the
//! [`StageKind`] sum type, with shared behavior (mount handling, commit
//! propagation, candidate selection) on `Stage` itself.

use crate::config::{ImageConfig, MountConfig, MountType};
use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::git::GitMapping;
use crate::image::{
    decode_custom_mount_from, encode_custom_mount_from, StageDescription, StageImage,
    MOUNT_BUILD_DIR_LABEL, MOUNT_CUSTOM_DIR_LABEL_PREFIX, MOUNT_TMP_DIR_LABEL,
    PROJECT_REPO_COMMIT_LABEL,
};
use crate::import::{ImportCoordinator, ImportServer};
use crate::paths::{clean_unix_path, expand_path, shared_context_dir};
use crate::runtime::ContainerRuntime;
use crate::slug::{limited_slug, DEFAULT_SLUG_MAX_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub mod dockerfile;
pub mod from;
pub mod git;
pub mod imports;
pub mod instructions;
pub mod user;

pub use dockerfile::DockerfileStage;
pub use from::FromStage;
pub use git::{GitArchiveStage, GitPatchStage};
pub use imports::ImportsStage;
pub use instructions::DockerInstructionsStage;
pub use user::UserCommandsStage;

/// Closed enumeration of stage names, in no particular order; the canonical
/// pipeline order is [`ALL_STAGES`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    From,
    BeforeInstall,
    ImportsBeforeInstall,
    GitArchive,
    Install,
    ImportsAfterInstall,
    BeforeSetup,
    ImportsBeforeSetup,
    Setup,
    ImportsAfterSetup,
    GitCache,
    GitLatestPatch,
    DockerInstructions,
    Dockerfile,
}

/// The canonical stage sequence. Traversal order is significant: each
/// stage's digest feeds the next stage's digest.
pub const ALL_STAGES: [StageName; 14] = [
    StageName::From,
    StageName::BeforeInstall,
    StageName::ImportsBeforeInstall,
    StageName::GitArchive,
    StageName::Install,
    StageName::ImportsAfterInstall,
    StageName::BeforeSetup,
    StageName::ImportsBeforeSetup,
    StageName::Setup,
    StageName::ImportsAfterSetup,
    StageName::GitCache,
    StageName::GitLatestPatch,
    StageName::DockerInstructions,
    StageName::Dockerfile,
];

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::From => "from",
            StageName::BeforeInstall => "beforeInstall",
            StageName::ImportsBeforeInstall => "importsBeforeInstall",
            StageName::GitArchive => "gitArchive",
            StageName::Install => "install",
            StageName::ImportsAfterInstall => "importsAfterInstall",
            StageName::BeforeSetup => "beforeSetup",
            StageName::ImportsBeforeSetup => "importsBeforeSetup",
            StageName::Setup => "setup",
            StageName::ImportsAfterSetup => "importsAfterSetup",
            StageName::GitCache => "gitCache",
            StageName::GitLatestPatch => "gitLatestPatch",
            StageName::DockerInstructions => "dockerInstructions",
            StageName::Dockerfile => "dockerfile",
        }
    }

    pub fn parse(s: &str) -> Option<StageName> {
        ALL_STAGES.iter().copied().find(|name| name.as_str() == s)
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cross-image queries answered by the conveyor while a stage is digested
/// or prepared. All referenced images are already resolved by the time a
/// consumer stage runs (the conveyor orders images topologically).
pub trait ImageLookup: Send + Sync {
    fn image_content_digest(&self, image_name: &str) -> Option<String>;
    fn image_stage_content_digest(&self, image_name: &str, stage: StageName) -> Option<String>;
    fn image_name_for_last_image_stage(&self, image_name: &str) -> Option<String>;
    fn image_name_for_image_stage(&self, image_name: &str, stage: StageName) -> Option<String>;
    fn image_id_for_last_image_stage(&self, image_name: &str) -> Option<String>;
    fn image_id_for_image_stage(&self, image_name: &str, stage: StageName) -> Option<String>;

    /// The import server handling copies out of `source_image_name`.
    fn import_server(&self, source_image_name: &str) -> Arc<dyn ImportServer>;
}

/// Dependencies a stage operation may need, injected per call.
pub struct StageServices<'a> {
    pub head_commit: &'a str,
    pub runtime: &'a dyn ContainerRuntime,
    pub imports: &'a ImportCoordinator,
    pub lookup: &'a dyn ImageLookup,
}

/// Kind-specific payload of a stage.
#[derive(Debug)]
pub enum StageKind {
    From(FromStage),
    UserCommands(UserCommandsStage),
    Imports(ImportsStage),
    GitArchive(GitArchiveStage),
    GitPatch(GitPatchStage),
    DockerInstructions(DockerInstructionsStage),
    Dockerfile(DockerfileStage),
}

/// One step of an image's pipeline: immutable inputs only.
#[derive(Debug)]
pub struct Stage {
    name: StageName,
    image_name: String,
    project_name: String,
    image_tmp_dir: PathBuf,
    config_mounts: Vec<MountConfig>,
    git_mappings: Vec<Arc<GitMapping>>,
    kind: StageKind,
}

impl Stage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: StageName,
        image_name: impl Into<String>,
        project_name: impl Into<String>,
        image_tmp_dir: impl Into<PathBuf>,
        config_mounts: Vec<MountConfig>,
        git_mappings: Vec<Arc<GitMapping>>,
        kind: StageKind,
    ) -> Self {
        Self {
            name,
            image_name: image_name.into(),
            project_name: project_name.into(),
            image_tmp_dir: image_tmp_dir.into(),
            config_mounts,
            git_mappings,
            kind,
        }
    }

    pub fn name(&self) -> StageName {
        self.name
    }

    /// Non-empty for named images, empty for the project's nameless image.
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    pub fn git_mappings(&self) -> &[Arc<GitMapping>] {
        &self.git_mappings
    }

    pub(crate) fn image_tmp_dir(&self) -> &Path {
        &self.image_tmp_dir
    }

    /// `<image>/<stage>`, with `~` for the nameless image.
    pub fn log_detailed_name(&self) -> String {
        let image = if self.image_name.is_empty() { "~" } else { &self.image_name };
        format!("{}/{}", image, self.name)
    }

    /// Whether this stage contributes nothing and is skipped for this plan.
    /// Monotone: once empty, it stays empty for the plan.
    pub async fn is_empty(
        &self,
        _services: &StageServices<'_>,
        prev_built: Option<&StageDescription>,
    ) -> Result<bool> {
        match &self.kind {
            StageKind::From(_) | StageKind::Dockerfile(_) => Ok(false),
            StageKind::UserCommands(s) => Ok(s.is_empty()),
            StageKind::Imports(s) => Ok(s.is_empty()),
            StageKind::GitArchive(_) => Ok(self.git_mappings.is_empty()),
            StageKind::GitPatch(s) => s.is_empty(self, prev_built).await,
            StageKind::DockerInstructions(s) => Ok(s.is_empty()),
        }
    }

    /// The digest-source string: every input that could alter this stage's
    /// output.
    pub async fn get_dependencies(
        &self,
        services: &StageServices<'_>,
        prev_built: Option<&StageDescription>,
    ) -> Result<String> {
        match &self.kind {
            StageKind::From(s) => s.get_dependencies(services).await,
            StageKind::UserCommands(s) => Ok(s.get_dependencies()),
            StageKind::Imports(s) => s.get_dependencies(self, services).await,
            StageKind::GitArchive(s) => Ok(s.get_dependencies(self)),
            StageKind::GitPatch(s) => s.get_dependencies(self, prev_built).await,
            StageKind::DockerInstructions(s) => Ok(s.get_dependencies()),
            StageKind::Dockerfile(s) => Ok(s.get_dependencies()),
        }
    }

    /// Extra string folded into the *next* stage's digest. Non-empty for
    /// stages that inject source content.
    ///
    /// `resolved` is this stage's own resolved description, when the
    /// conveyor already looked it up or built it.
    pub async fn get_next_stage_dependencies(
        &self,
        resolved: Option<&StageDescription>,
    ) -> Result<String> {
        match &self.kind {
            StageKind::GitArchive(_) | StageKind::GitPatch(_) => {
                self.next_stage_git_dependencies(resolved).await
            }
            _ => Ok(String::new()),
        }
    }

    /// SHA-256 over the sorted per-mapping commits: from the resolved
    /// image's labels when available, else each mapping's latest commit.
    /// Sorting keeps mapping iteration order out of the digest.
    pub(crate) async fn next_stage_git_dependencies(
        &self,
        resolved: Option<&StageDescription>,
    ) -> Result<String> {
        let mut args = Vec::new();

        for mapping in &self.git_mappings {
            let commit = match resolved {
                Some(description) => {
                    mapping
                        .built_image_commit_info(&description.info.labels)
                        .map_err(|e| WerfError::MalformedLabels {
                            image: description.info.name.clone(),
                            reason: format!(
                                "unable to get built image commit info: {}",
                                e
                            ),
                        })?
                        .commit
                }
                None => mapping.latest_commit_info().await?.commit,
            };
            args.push(commit);
        }

        debug!(stage = %self.name, ?args, "next stage git dependencies");
        args.sort();

        Ok(sha256_hash(&args))
    }

    /// Populate the abstract image spec for this stage. Never performs
    /// builds.
    pub async fn prepare_image(
        &self,
        services: &StageServices<'_>,
        prev_built: Option<&StageDescription>,
        image: &mut StageImage,
    ) -> Result<()> {
        match &self.kind {
            // from and dockerfile bypass base preparation: no mounts, no
            // service labels on the seed image
            StageKind::From(s) => {
                s.prepare_image(image);
                Ok(())
            }
            StageKind::Dockerfile(s) => {
                s.prepare_image(image);
                Ok(())
            }
            kind => {
                self.base_prepare(services, prev_built, image)?;
                match kind {
                    StageKind::UserCommands(s) => {
                        s.prepare_image(image);
                        Ok(())
                    }
                    StageKind::Imports(s) => s.prepare_image(self, services, image).await,
                    StageKind::GitArchive(s) => s.prepare_image(self, image).await,
                    StageKind::GitPatch(s) => {
                        s.prepare_image(self, prev_built, image).await
                    }
                    StageKind::DockerInstructions(s) => {
                        s.prepare_image(image);
                        Ok(())
                    }
                    StageKind::From(_) | StageKind::Dockerfile(_) => unreachable!(),
                }
            }
        }
    }

    /// Shared preparation: head commit label plus service and custom mounts,
    /// merged from the previous built image's labels and the declarative
    /// config, re-persisted as labels and materialized as volumes.
    fn base_prepare(
        &self,
        services: &StageServices<'_>,
        prev_built: Option<&StageDescription>,
        image: &mut StageImage,
    ) -> Result<()> {
        image.add_label(PROJECT_REPO_COMMIT_LABEL, services.head_commit);

        let service_mounts = self.service_mounts(prev_built);
        self.add_service_mounts_labels(&service_mounts, image);
        self.add_service_mounts_volumes(&service_mounts, image)?;

        let custom_mounts = self.custom_mounts(prev_built);
        self.add_custom_mounts_labels(&custom_mounts, image);
        self.add_custom_mounts_volumes(&custom_mounts, image)?;

        Ok(())
    }

    /// Pick a prior build of this stage from same-digest candidates, or
    /// none. Deterministic.
    pub async fn select_suitable_stage(
        &self,
        candidates: Vec<StageDescription>,
    ) -> Result<Option<StageDescription>> {
        match &self.kind {
            StageKind::GitArchive(_) | StageKind::GitPatch(_) => {
                let ancestors = self.select_ancestors_by_git_mappings(candidates).await?;
                Ok(select_oldest(ancestors))
            }
            _ => Ok(select_oldest(candidates)),
        }
    }

    /// Keep only candidates whose recorded commit is, for every mapping, an
    /// ancestor of the current commit (virtual-merge normalized on both
    /// sides). Candidates with unparseable labels are logged and skipped.
    async fn select_ancestors_by_git_mappings(
        &self,
        candidates: Vec<StageDescription>,
    ) -> Result<Vec<StageDescription>> {
        let mut current_commits = Vec::with_capacity(self.git_mappings.len());
        for mapping in &self.git_mappings {
            let info = mapping.latest_commit_info().await?;
            current_commits.push(info.real_commit().to_string());
        }

        let mut suitable = Vec::new();

        'candidates: for description in candidates {
            for (i, mapping) in self.git_mappings.iter().enumerate() {
                let commit_info =
                    match mapping.built_image_commit_info(&description.info.labels) {
                        Ok(info) => info,
                        Err(e) => {
                            warn!(
                                image = %description.info.name,
                                repo = mapping.repo.name(),
                                "ignoring stage candidate: {}",
                                e
                            );
                            continue 'candidates;
                        }
                    };

                let commit_to_check = commit_info.real_commit();
                let current = &current_commits[i];

                let is_ancestor =
                    mapping.repo.is_ancestor(commit_to_check, current).await.map_err(
                        |e| WerfError::Git {
                            repo: mapping.repo.name().to_string(),
                            reason: format!(
                                "error checking commits ancestry {}<-{}: {}",
                                commit_to_check, current, e
                            ),
                        },
                    )?;

                if !is_ancestor {
                    debug!(
                        image = %description.info.name,
                        commit = commit_to_check,
                        current = %current,
                        "candidate commit is not an ancestor, ignoring"
                    );
                    continue 'candidates;
                }
            }

            suitable.push(description);
        }

        Ok(suitable)
    }

    fn service_mounts(
        &self,
        prev_built: Option<&StageDescription>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        merge_mounts(
            self.service_mounts_from_labels(prev_built),
            self.service_mounts_from_config(),
        )
    }

    fn service_mounts_from_labels(
        &self,
        prev_built: Option<&StageDescription>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut mounts = BTreeMap::new();

        let labels = match prev_built {
            Some(description) => &description.info.labels,
            None => return mounts,
        };

        for (label, mount_type) in [
            (MOUNT_TMP_DIR_LABEL, "tmp_dir"),
            (MOUNT_BUILD_DIR_LABEL, "build_dir"),
        ] {
            if let Some(value) = labels.get(label) {
                mounts.insert(mount_type.to_string(), split_mountpoints(value));
            }
        }

        mounts
    }

    fn service_mounts_from_config(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut mounts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for mount in &self.config_mounts {
            let mount_type = match mount.mount_type {
                MountType::TmpDir => "tmp_dir",
                MountType::BuildDir => "build_dir",
                MountType::CustomDir => continue,
            };
            mounts
                .entry(mount_type.to_string())
                .or_default()
                .insert(clean_unix_path(&mount.to));
        }

        mounts
    }

    fn add_service_mounts_labels(
        &self,
        mounts: &BTreeMap<String, BTreeSet<String>>,
        image: &mut StageImage,
    ) {
        for (mount_type, mountpoints) in mounts {
            let label = match mount_type.as_str() {
                "tmp_dir" => MOUNT_TMP_DIR_LABEL,
                "build_dir" => MOUNT_BUILD_DIR_LABEL,
                other => panic!("unknown mount type {}", other),
            };
            image.add_label(label, join_mountpoints(mountpoints));
        }
    }

    fn add_service_mounts_volumes(
        &self,
        mounts: &BTreeMap<String, BTreeSet<String>>,
        image: &mut StageImage,
    ) -> Result<()> {
        for (mount_type, mountpoints) in mounts {
            for mountpoint in mountpoints {
                let mountpoint = clean_unix_path(mountpoint);
                let slug = limited_slug(&mountpoint, DEFAULT_SLUG_MAX_SIZE);

                let from = match mount_type.as_str() {
                    "tmp_dir" => self.image_tmp_dir.join("mount").join(slug),
                    "build_dir" => shared_context_dir()
                        .join("mounts")
                        .join("projects")
                        .join(&self.project_name)
                        .join(slug),
                    other => panic!("unknown mount type {}", other),
                };

                std::fs::create_dir_all(&from).map_err(|e| WerfError::io(&from, e))?;
                image.add_volume(from.to_string_lossy(), mountpoint);
            }
        }

        Ok(())
    }

    fn custom_mounts(
        &self,
        prev_built: Option<&StageDescription>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        merge_mounts(
            self.custom_mounts_from_labels(prev_built),
            self.custom_mounts_from_config(),
        )
    }

    fn custom_mounts_from_labels(
        &self,
        prev_built: Option<&StageDescription>,
    ) -> BTreeMap<String, BTreeSet<String>> {
        let mut mounts = BTreeMap::new();

        let labels = match prev_built {
            Some(description) => &description.info.labels,
            None => return mounts,
        };

        for (key, value) in labels {
            if let Some(encoded) = key.strip_prefix(MOUNT_CUSTOM_DIR_LABEL_PREFIX) {
                mounts.insert(decode_custom_mount_from(encoded), split_mountpoints(value));
            }
        }

        mounts
    }

    fn custom_mounts_from_config(&self) -> BTreeMap<String, BTreeSet<String>> {
        let mut mounts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for mount in &self.config_mounts {
            if mount.mount_type != MountType::CustomDir {
                continue;
            }
            mounts
                .entry(mount.from.clone())
                .or_default()
                .insert(clean_unix_path(&mount.to));
        }

        mounts
    }

    fn add_custom_mounts_labels(
        &self,
        mounts: &BTreeMap<String, BTreeSet<String>>,
        image: &mut StageImage,
    ) {
        for (from, mountpoints) in mounts {
            let label =
                format!("{}{}", MOUNT_CUSTOM_DIR_LABEL_PREFIX, encode_custom_mount_from(from));
            image.add_label(label, join_mountpoints(mountpoints));
        }
    }

    fn add_custom_mounts_volumes(
        &self,
        mounts: &BTreeMap<String, BTreeSet<String>>,
        image: &mut StageImage,
    ) -> Result<()> {
        for (from, mountpoints) in mounts {
            let absolute_from = expand_path(from);

            if !absolute_from.exists() {
                std::fs::create_dir_all(&absolute_from)
                    .map_err(|e| WerfError::io(&absolute_from, e))?;
            }

            for mountpoint in mountpoints {
                image.add_volume(absolute_from.to_string_lossy(), clean_unix_path(mountpoint));
            }
        }

        Ok(())
    }
}

/// Union of mountpoints per key, de-duplicated. Commutative up to the
/// resulting value sets.
pub(crate) fn merge_mounts(
    a: BTreeMap<String, BTreeSet<String>>,
    b: BTreeMap<String, BTreeSet<String>>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut merged = a;
    for (key, mountpoints) in b {
        merged.entry(key).or_default().extend(mountpoints);
    }
    merged
}

fn split_mountpoints(value: &str) -> BTreeSet<String> {
    value.split(';').filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn join_mountpoints(mountpoints: &BTreeSet<String>) -> String {
    mountpoints.iter().cloned().collect::<Vec<_>>().join(";")
}

/// Default candidate selection: oldest by `unique_id_as_time`, ties broken
/// by image name so iteration order never leaks into the result.
pub(crate) fn select_oldest(candidates: Vec<StageDescription>) -> Option<StageDescription> {
    candidates
        .into_iter()
        .min_by(|a, b| {
            a.stage_id
                .unique_id
                .cmp(&b.stage_id.unique_id)
                .then_with(|| a.info.name.cmp(&b.info.name))
        })
}

/// Build the stage plan of one image in [`ALL_STAGES`] order.
///
/// Every potentially relevant stage is constructed; emptiness is decided
/// later, per plan, by `is_empty`.
pub fn plan_stages(
    project_name: &str,
    image: &ImageConfig,
    image_tmp_dir: &Path,
    git_mappings: Vec<Arc<GitMapping>>,
) -> Vec<Stage> {
    let new_stage = |name: StageName, kind: StageKind| {
        Stage::new(
            name,
            image.name.clone(),
            project_name,
            image_tmp_dir,
            image.mounts.clone(),
            git_mappings.clone(),
            kind,
        )
    };

    if let Some(dockerfile) = &image.dockerfile {
        return vec![new_stage(
            StageName::Dockerfile,
            StageKind::Dockerfile(DockerfileStage::from_config(dockerfile)),
        )];
    }

    let mut stages = Vec::new();

    for name in ALL_STAGES {
        let kind = match name {
            StageName::From => match &image.from {
                Some(base_image) => StageKind::From(FromStage::new(
                    base_image.clone(),
                    image.from_cache_version.clone(),
                )),
                None => continue,
            },
            StageName::BeforeInstall => StageKind::UserCommands(UserCommandsStage::new(
                image.shell.before_install.clone(),
                image.shell.before_install_cache_version.clone(),
            )),
            StageName::Install => StageKind::UserCommands(UserCommandsStage::new(
                image.shell.install.clone(),
                image.shell.install_cache_version.clone(),
            )),
            StageName::BeforeSetup => StageKind::UserCommands(UserCommandsStage::new(
                image.shell.before_setup.clone(),
                image.shell.before_setup_cache_version.clone(),
            )),
            StageName::Setup => StageKind::UserCommands(UserCommandsStage::new(
                image.shell.setup.clone(),
                image.shell.setup_cache_version.clone(),
            )),
            StageName::ImportsBeforeInstall => {
                StageKind::Imports(ImportsStage::before(image, StageName::Install))
            }
            StageName::ImportsAfterInstall => {
                StageKind::Imports(ImportsStage::after(image, StageName::Install))
            }
            StageName::ImportsBeforeSetup => {
                StageKind::Imports(ImportsStage::before(image, StageName::Setup))
            }
            StageName::ImportsAfterSetup => {
                StageKind::Imports(ImportsStage::after(image, StageName::Setup))
            }
            StageName::GitArchive => StageKind::GitArchive(GitArchiveStage::new()),
            StageName::GitCache => StageKind::GitPatch(GitPatchStage::cache()),
            StageName::GitLatestPatch => StageKind::GitPatch(GitPatchStage::latest()),
            StageName::DockerInstructions => {
                StageKind::DockerInstructions(DockerInstructionsStage::new(
                    image.docker.clone(),
                ))
            }
            StageName::Dockerfile => continue,
        };

        stages.push(new_stage(name, kind));
    }

    stages
}
