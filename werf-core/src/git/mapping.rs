//! Per-image git mapping: one source repository, path-filtered, feeding the
//! git stages of a single image.

use crate::config::GitMappingConfig;
use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::image::{StageDescription, GIT_MAPPING_LABEL_PREFIX};
use crate::git::{CommitInfo, GitRepo, PathScope};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Binds a repository and path filter to an image's stages.
///
/// Mappings are shared by all stages of an image; stages hold a handle, the
/// mapping never points back.
#[derive(Debug, Clone)]
pub struct GitMapping {
    pub name: String,
    pub repo: Arc<dyn GitRepo>,
    pub add: String,
    pub to: String,
    pub owner: String,
    pub group: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl GitMapping {
    pub fn from_config(config: &GitMappingConfig, repo: Arc<dyn GitRepo>) -> Self {
        Self {
            name: config.name.clone(),
            repo,
            add: config.add.clone(),
            to: config.to.clone(),
            owner: config.owner.clone(),
            group: config.group.clone(),
            include_paths: config.include_paths.clone(),
            exclude_paths: config.exclude_paths.clone(),
        }
    }

    /// Identity of the mapping itself: everything that shapes what it puts
    /// into the image, independent of any commit.
    pub fn paramshash(&self) -> String {
        let include_paths = self.include_paths.join("///");
        let exclude_paths = self.exclude_paths.join("///");
        sha256_hash(&[
            self.repo.name(),
            self.add.as_str(),
            self.to.as_str(),
            self.owner.as_str(),
            self.group.as_str(),
            include_paths.as_str(),
            exclude_paths.as_str(),
        ])
    }

    /// Short mapping id used in label keys.
    pub fn label_id(&self) -> String {
        self.paramshash()[..16].to_string()
    }

    fn commit_label(&self) -> String {
        format!("{}{}-commit", GIT_MAPPING_LABEL_PREFIX, self.label_id())
    }

    fn virtual_merge_label(&self) -> String {
        format!("{}{}-virtual-merge", GIT_MAPPING_LABEL_PREFIX, self.label_id())
    }

    fn virtual_merge_from_commit_label(&self) -> String {
        format!("{}{}-virtual-merge-from-commit", GIT_MAPPING_LABEL_PREFIX, self.label_id())
    }

    /// The path filter this mapping applies to archives and patches.
    pub fn path_scope(&self) -> PathScope {
        PathScope {
            add: self.add.clone(),
            include_paths: self.include_paths.clone(),
            exclude_paths: self.exclude_paths.clone(),
        }
    }

    /// Latest commit of the mapping's current checkout.
    pub async fn latest_commit_info(&self) -> Result<CommitInfo> {
        self.repo.head_commit_info().await
    }

    /// Parse the commit recorded on a built image back out of its labels.
    ///
    /// Fails on missing or malformed labels; callers selecting cache
    /// candidates ignore the candidate on failure.
    pub fn built_image_commit_info(
        &self,
        labels: &HashMap<String, String>,
    ) -> Result<CommitInfo> {
        let commit = labels.get(&self.commit_label()).ok_or_else(|| {
            WerfError::MalformedLabels {
                image: String::new(),
                reason: format!("missing label {}", self.commit_label()),
            }
        })?;

        let virtual_merge = labels
            .get(&self.virtual_merge_label())
            .map(|v| v == "true")
            .unwrap_or(false);

        let virtual_merge_from_commit = labels
            .get(&self.virtual_merge_from_commit_label())
            .cloned()
            .unwrap_or_default();

        if virtual_merge && virtual_merge_from_commit.is_empty() {
            return Err(WerfError::MalformedLabels {
                image: String::new(),
                reason: format!(
                    "virtual merge commit {} has no recorded origin commit",
                    commit
                ),
            });
        }

        Ok(CommitInfo { commit: commit.clone(), virtual_merge, virtual_merge_from_commit })
    }

    /// Persist `info` into the labels a new stage image will be committed
    /// with, so later builds can recover it.
    pub fn write_commit_labels(&self, info: &CommitInfo, labels: &mut BTreeMap<String, String>) {
        labels.insert(self.commit_label(), info.commit.clone());
        labels.insert(self.virtual_merge_label(), info.virtual_merge.to_string());
        if info.virtual_merge {
            labels.insert(
                self.virtual_merge_from_commit_label(),
                info.virtual_merge_from_commit.clone(),
            );
        }
    }

    /// The commit a previously built image was produced from, normalized
    /// through the virtual-merge rewriting.
    pub fn base_commit_for_prev_built_image(
        &self,
        prev_built: &StageDescription,
    ) -> Result<String> {
        let info = self.built_image_commit_info(&prev_built.info.labels).map_err(|e| {
            WerfError::MalformedLabels {
                image: prev_built.info.name.clone(),
                reason: e.to_string(),
            }
        })?;
        Ok(info.real_commit().to_string())
    }

    /// Whether the patch from the previous built image to the current commit
    /// is empty under this mapping's path filter.
    pub async fn is_patch_empty(&self, prev_built: &StageDescription) -> Result<bool> {
        Ok(self.patch_content(prev_built).await?.is_empty())
    }

    /// The canonical textual patch from the previous built image's commit to
    /// the current commit.
    ///
    /// The base commit missing from the current checkout is a hard error at
    /// patch time.
    pub async fn patch_content(&self, prev_built: &StageDescription) -> Result<String> {
        let base_commit = self.base_commit_for_prev_built_image(prev_built)?;

        if !self.repo.is_commit_exists(&base_commit).await? {
            return Err(WerfError::MissingCommit {
                repo: self.repo.name().to_string(),
                commit: base_commit,
            });
        }

        let current = self.latest_commit_info().await?;
        self.repo.diff(&base_commit, current.real_commit(), &self.path_scope()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageInfo, StageId};
    use async_trait::async_trait;
    use std::path::Path;

    #[derive(Debug)]
    struct StubRepo;

    #[async_trait]
    impl GitRepo for StubRepo {
        fn name(&self) -> &str {
            "stub"
        }
        async fn head_commit_info(&self) -> Result<CommitInfo> {
            Ok(CommitInfo::plain("head"))
        }
        async fn is_ancestor(&self, _older: &str, _newer: &str) -> Result<bool> {
            Ok(true)
        }
        async fn is_commit_exists(&self, _commit: &str) -> Result<bool> {
            Ok(true)
        }
        async fn diff(&self, _f: &str, _t: &str, _s: &PathScope) -> Result<String> {
            Ok(String::new())
        }
        async fn create_archive(&self, _c: &str, _s: &PathScope, _o: &Path) -> Result<()> {
            Ok(())
        }
    }

    fn mapping() -> GitMapping {
        GitMapping {
            name: "main".into(),
            repo: Arc::new(StubRepo),
            add: "/".into(),
            to: "/app".into(),
            owner: String::new(),
            group: String::new(),
            include_paths: vec![],
            exclude_paths: vec![],
        }
    }

    #[test]
    fn test_commit_labels_roundtrip() {
        let m = mapping();
        let info = CommitInfo {
            commit: "merge-commit".into(),
            virtual_merge: true,
            virtual_merge_from_commit: "real-commit".into(),
        };

        let mut labels = BTreeMap::new();
        m.write_commit_labels(&info, &mut labels);

        let parsed = m
            .built_image_commit_info(&labels.into_iter().collect())
            .expect("labels should parse back");
        assert_eq!(parsed, info);
        assert_eq!(parsed.real_commit(), "real-commit");
    }

    #[test]
    fn test_missing_commit_label_is_an_error() {
        let m = mapping();
        assert!(m.built_image_commit_info(&HashMap::new()).is_err());
    }

    #[test]
    fn test_paramshash_ignores_repo_state() {
        let a = mapping().paramshash();
        let b = mapping().paramshash();
        assert_eq!(a, b);

        let mut other = mapping();
        other.to = "/other".into();
        assert_ne!(a, other.paramshash());
    }

    #[tokio::test]
    async fn test_base_commit_uses_virtual_merge_origin() {
        let m = mapping();
        let info = CommitInfo {
            commit: "M".into(),
            virtual_merge: true,
            virtual_merge_from_commit: "X".into(),
        };

        let mut labels = BTreeMap::new();
        m.write_commit_labels(&info, &mut labels);

        let prev = StageDescription {
            stage_id: StageId::new("digest"),
            info: ImageInfo { labels: labels.into_iter().collect(), ..Default::default() },
        };

        assert_eq!(m.base_commit_for_prev_built_image(&prev).unwrap(), "X");
    }
}
