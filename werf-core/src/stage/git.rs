//! Git stages: gitArchive seeds the image with a clean checkout, gitCache
//! and gitLatestPatch apply incremental patches on top of a previous build.

use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::image::{StageDescription, StageImage};
use crate::paths::{join_unix_path, CONTAINER_SERVICE_DIR};
use crate::stage::Stage;
use crate::stapel;
use tracing::debug;

/// Seeds the image filesystem with a clean checkout at the current commit.
///
/// Cache candidates are restricted to builds whose recorded commit is an
/// ancestor of the current commit, so an archive built from an older commit
/// can be patched forward instead of rebuilt.
#[derive(Debug, Default)]
pub struct GitArchiveStage;

impl GitArchiveStage {
    pub fn new() -> Self {
        Self
    }

    /// The archive identity is the mappings themselves, not any commit:
    /// commit identity flows through `get_next_stage_dependencies` and the
    /// ancestry-restricted candidate selection.
    pub fn get_dependencies(&self, stage: &Stage) -> String {
        let args: Vec<String> =
            stage.git_mappings().iter().map(|mapping| mapping.paramshash()).collect();
        sha256_hash(&args)
    }

    pub async fn prepare_image(&self, stage: &Stage, image: &mut StageImage) -> Result<()> {
        for mapping in stage.git_mappings() {
            let info = mapping.latest_commit_info().await?;
            mapping.write_commit_labels(&info, &mut image.labels);

            let archive_name = format!("{}.tar", mapping.label_id());
            let host_path =
                stage.image_tmp_dir().join("git-archives").join(&archive_name);
            let container_path = join_unix_path(
                &join_unix_path(CONTAINER_SERVICE_DIR, "git-archives"),
                &archive_name,
            );

            mapping
                .repo
                .create_archive(&info.commit, &mapping.path_scope(), &host_path)
                .await
                .map_err(|e| WerfError::Git {
                    repo: mapping.repo.name().to_string(),
                    reason: format!(
                        "unable to create archive of commit {}: {}",
                        info.commit, e
                    ),
                })?;

            image.volumes.push(format!(
                "{}:{}:ro",
                host_path.to_string_lossy(),
                container_path
            ));
            image.add_service_run_command(format!(
                "{} -d {} && {} -xf {} -C {}",
                stapel::install_bin_path(),
                mapping.to,
                stapel::tar_bin_path(),
                container_path,
                mapping.to,
            ));

            debug!(
                mapping = %mapping.name,
                commit = %info.commit,
                "git archive prepared"
            );
        }

        Ok(())
    }
}

/// Incremental patch application from the previous built image's commit to
/// the current commit.
///
/// `gitCache` re-keys at commit granularity; `gitLatestPatch` re-keys on the
/// patch text itself, so a meaningful change in the patch (even with the
/// same endpoints across rebases) produces a new identity.
#[derive(Debug)]
pub struct GitPatchStage {
    latest: bool,
}

impl GitPatchStage {
    pub fn cache() -> Self {
        Self { latest: false }
    }

    pub fn latest() -> Self {
        Self { latest: true }
    }

    /// Empty iff every mapping's patch is empty. A missing base commit in
    /// the checkout is a hard error at patch time, not emptiness.
    pub async fn is_empty(
        &self,
        stage: &Stage,
        prev_built: Option<&StageDescription>,
    ) -> Result<bool> {
        if stage.git_mappings().is_empty() {
            return Ok(true);
        }

        let prev_built = match prev_built {
            Some(prev_built) => prev_built,
            None => return Ok(true),
        };

        for mapping in stage.git_mappings() {
            let base_commit = mapping.base_commit_for_prev_built_image(prev_built)?;

            if !mapping.repo.is_commit_exists(&base_commit).await? {
                return Err(WerfError::MissingCommit {
                    repo: mapping.repo.name().to_string(),
                    commit: base_commit,
                });
            }

            if !mapping.is_patch_empty(prev_built).await? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    pub async fn get_dependencies(
        &self,
        stage: &Stage,
        prev_built: Option<&StageDescription>,
    ) -> Result<String> {
        if self.latest {
            let prev_built = prev_built.ok_or_else(|| WerfError::StageFailed {
                image: stage.image_name().to_string(),
                stage: stage.name().to_string(),
                reason: "no previous built image to patch from".to_string(),
            })?;

            let mut args = Vec::new();
            for mapping in stage.git_mappings() {
                let patch =
                    mapping.patch_content(prev_built).await.map_err(|e| {
                        WerfError::Git {
                            repo: mapping.repo.name().to_string(),
                            reason: format!(
                                "error getting patch between previous built image {} and current commit: {}",
                                prev_built.info.name, e
                            ),
                        }
                    })?;
                args.push(patch);
            }

            Ok(sha256_hash(&args))
        } else {
            let mut args = Vec::new();
            for mapping in stage.git_mappings() {
                args.push(mapping.latest_commit_info().await?.commit);
            }
            args.sort();

            Ok(sha256_hash(&args))
        }
    }

    pub async fn prepare_image(
        &self,
        stage: &Stage,
        prev_built: Option<&StageDescription>,
        image: &mut StageImage,
    ) -> Result<()> {
        let prev_built = prev_built.ok_or_else(|| WerfError::StageFailed {
            image: stage.image_name().to_string(),
            stage: stage.name().to_string(),
            reason: "no previous built image to patch from".to_string(),
        })?;

        for mapping in stage.git_mappings() {
            let patch = mapping.patch_content(prev_built).await?;

            let info = mapping.latest_commit_info().await?;
            mapping.write_commit_labels(&info, &mut image.labels);

            if patch.is_empty() {
                continue;
            }

            let patch_name = format!("{}.patch", mapping.label_id());
            let host_path = stage.image_tmp_dir().join("git-patches").join(&patch_name);
            if let Some(parent) = host_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| WerfError::io(parent, e))?;
            }
            tokio::fs::write(&host_path, &patch)
                .await
                .map_err(|e| WerfError::io(&host_path, e))?;

            let container_path = join_unix_path(
                &join_unix_path(CONTAINER_SERVICE_DIR, "git-patches"),
                &patch_name,
            );

            image.volumes.push(format!(
                "{}:{}:ro",
                host_path.to_string_lossy(),
                container_path
            ));
            image.add_service_run_command(format!(
                "{} apply --whitespace=nowarn --directory={} {}",
                stapel::git_bin_path(),
                mapping.to,
                container_path,
            ));

            debug!(mapping = %mapping.name, commit = %info.commit, "git patch prepared");
        }

        Ok(())
    }
}
