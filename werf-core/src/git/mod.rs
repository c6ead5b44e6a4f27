//! Source repository access for git-sensitive stages.
//!
//! The pipeline never walks history itself; everything goes through the
//! [`GitRepo`] trait so tests and alternative backends can swap in.

use crate::error::{Result, WerfError};
use crate::paths::join_unix_path;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

pub mod mapping;

pub use mapping::GitMapping;

/// A commit as seen by the pipeline.
///
/// When a commit is a synthesized merge (produced upstream to test PR
/// integration), the "real" source commit used for ancestry is
/// `virtual_merge_from_commit`, never `commit`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit: String,
    pub virtual_merge: bool,
    pub virtual_merge_from_commit: String,
}

impl CommitInfo {
    pub fn plain(commit: impl Into<String>) -> Self {
        Self { commit: commit.into(), ..Default::default() }
    }

    /// The commit ancestry checks must use.
    pub fn real_commit(&self) -> &str {
        if self.virtual_merge {
            &self.virtual_merge_from_commit
        } else {
            &self.commit
        }
    }
}

/// Path filter applied to archives and patches: a source dir plus optional
/// include/exclude globs relative to it.
#[derive(Debug, Clone, Default)]
pub struct PathScope {
    pub add: String,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
}

impl PathScope {
    /// Git pathspecs equivalent to this scope.
    pub fn pathspecs(&self) -> Vec<String> {
        let mut specs = Vec::new();

        if self.include_paths.is_empty() {
            specs.push(join_unix_path("/", &self.add).trim_start_matches('/').to_string());
        } else {
            for include in &self.include_paths {
                specs.push(
                    join_unix_path(&self.add, include).trim_start_matches('/').to_string(),
                );
            }
        }

        for exclude in &self.exclude_paths {
            let path = join_unix_path(&self.add, exclude).trim_start_matches('/').to_string();
            specs.push(format!(":(exclude){}", path));
        }

        specs
    }
}

/// Queries on one source repository.
#[async_trait]
pub trait GitRepo: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Latest commit of the current checkout.
    async fn head_commit_info(&self) -> Result<CommitInfo>;

    /// Whether `older` is an ancestor of `newer`. Reflexive:
    /// `is_ancestor(x, x)` is true.
    async fn is_ancestor(&self, older: &str, newer: &str) -> Result<bool>;

    async fn is_commit_exists(&self, commit: &str) -> Result<bool>;

    /// Canonical textual patch between two commits under `scope`.
    async fn diff(&self, from_commit: &str, to_commit: &str, scope: &PathScope)
        -> Result<String>;

    /// Write a tar archive of `commit` under `scope` to `out_path`.
    async fn create_archive(&self, commit: &str, scope: &PathScope, out_path: &Path)
        -> Result<()>;
}

/// A repository checked out on the local filesystem, driven via the git CLI.
#[derive(Debug)]
pub struct LocalGitRepo {
    name: String,
    workdir: PathBuf,
    /// Declared origin commit when the current head is a synthesized merge.
    virtual_merge_from_commit: Option<String>,
}

impl LocalGitRepo {
    pub fn new(name: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), workdir: workdir.into(), virtual_merge_from_commit: None }
    }

    /// Declare the head as a virtual merge with the given origin commit.
    pub fn with_virtual_merge_head(mut self, from_commit: impl Into<String>) -> Self {
        self.virtual_merge_from_commit = Some(from_commit.into());
        self
    }

    async fn git(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(repo = %self.name, ?args, "running git");
        Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()
            .await
            .map_err(|e| WerfError::Git {
                repo: self.name.clone(),
                reason: format!("unable to run git {:?}: {}", args, e),
            })
    }

    async fn git_ok(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(WerfError::Git {
                repo: self.name.clone(),
                reason: format!(
                    "git {:?} failed: {}",
                    args,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl GitRepo for LocalGitRepo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head_commit_info(&self) -> Result<CommitInfo> {
        let head = self.git_ok(&["rev-parse", "HEAD"]).await?.trim().to_string();

        Ok(match &self.virtual_merge_from_commit {
            Some(from) => CommitInfo {
                commit: head,
                virtual_merge: true,
                virtual_merge_from_commit: from.clone(),
            },
            None => CommitInfo::plain(head),
        })
    }

    async fn is_ancestor(&self, older: &str, newer: &str) -> Result<bool> {
        if older == newer {
            return Ok(true);
        }

        let output = self.git(&["merge-base", "--is-ancestor", older, newer]).await?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(WerfError::Git {
                repo: self.name.clone(),
                reason: format!(
                    "ancestry check {}<-{} failed: {}",
                    older,
                    newer,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            }),
        }
    }

    async fn is_commit_exists(&self, commit: &str) -> Result<bool> {
        let spec = format!("{}^{{commit}}", commit);
        let output = self.git(&["cat-file", "-e", &spec]).await?;
        Ok(output.status.success())
    }

    async fn diff(
        &self,
        from_commit: &str,
        to_commit: &str,
        scope: &PathScope,
    ) -> Result<String> {
        let mut args =
            vec!["diff".to_string(), from_commit.to_string(), to_commit.to_string()];
        args.push("--".to_string());
        args.extend(scope.pathspecs());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git_ok(&arg_refs).await
    }

    async fn create_archive(
        &self,
        commit: &str,
        scope: &PathScope,
        out_path: &Path,
    ) -> Result<()> {
        if let Some(parent) = out_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| WerfError::io(parent, e))?;
        }

        let out = out_path.to_string_lossy().to_string();
        let mut args = vec![
            "archive".to_string(),
            "--format".to_string(),
            "tar".to_string(),
            "-o".to_string(),
            out,
            commit.to_string(),
            "--".to_string(),
        ];
        args.extend(scope.pathspecs());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git_ok(&arg_refs).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_real_commit_normalization() {
        let plain = CommitInfo::plain("abc");
        assert_eq!(plain.real_commit(), "abc");

        let merged = CommitInfo {
            commit: "merge".into(),
            virtual_merge: true,
            virtual_merge_from_commit: "origin".into(),
        };
        assert_eq!(merged.real_commit(), "origin");
    }

    #[test]
    fn test_pathspecs_without_includes() {
        let scope = PathScope { add: "/src".into(), ..Default::default() };
        assert_eq!(scope.pathspecs(), vec!["src"]);
    }

    #[test]
    fn test_pathspecs_with_filters() {
        let scope = PathScope {
            add: "/app".into(),
            include_paths: vec!["src".into()],
            exclude_paths: vec!["src/vendor".into()],
        };
        assert_eq!(scope.pathspecs(), vec!["app/src", ":(exclude)app/src/vendor"]);
    }
}
