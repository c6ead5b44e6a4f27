//! Filesystem-backed stages storage.
//!
//! Layout:
//!
//! ```text
//! stages/<project>/<digest>/<unique_id>.json
//! import-metadata/<project>/<import_source_id>.json
//! ```
//!
//! Writes land through a temp file + rename, so a record either exists
//! completely or not at all; concurrent readers never observe partial
//! writes.

use crate::error::{Result, WerfError};
use crate::image::StageDescription;
use crate::storage::{ImportMetadata, StagesStorage};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug)]
pub struct FsStagesStorage {
    root: PathBuf,
}

impl FsStagesStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| WerfError::io(&root, e))?;
        Ok(Self { root })
    }

    fn digest_dir(&self, project: &str, digest: &str) -> PathBuf {
        self.root.join("stages").join(project).join(digest)
    }

    fn import_metadata_path(&self, project: &str, import_source_id: &str) -> PathBuf {
        self.root
            .join("import-metadata")
            .join(project)
            .join(format!("{}.json", import_source_id))
    }

    fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| WerfError::storage(format!("no parent for {}", path.display())))?;
        std::fs::create_dir_all(parent).map_err(|e| WerfError::io(parent, e))?;

        let json = serde_json::to_string_pretty(value)?;

        let tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| WerfError::io(parent, e))?;
        std::fs::write(tmp.path(), json).map_err(|e| WerfError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| WerfError::io(path, e.error))?;

        Ok(())
    }
}

#[async_trait]
impl StagesStorage for FsStagesStorage {
    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>> {
        let dir = self.digest_dir(project, digest);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut descriptions = Vec::new();
        let mut entries =
            tokio::fs::read_dir(&dir).await.map_err(|e| WerfError::io(&dir, e))?;

        while let Some(entry) =
            entries.next_entry().await.map_err(|e| WerfError::io(&dir, e))?
        {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                let content = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| WerfError::io(&path, e))?;
                match serde_json::from_str::<StageDescription>(&content) {
                    Ok(description) => descriptions.push(description),
                    Err(e) => {
                        // unreadable records are not candidates
                        warn!(path = %path.display(), "skipping unreadable stage record: {}", e);
                    }
                }
            }
        }

        debug!(project, digest, count = descriptions.len(), "stage lookup");
        Ok(descriptions)
    }

    async fn put_stage(&self, project: &str, description: &StageDescription) -> Result<()> {
        let path = self
            .digest_dir(project, &description.stage_id.digest)
            .join(format!("{}.json", description.stage_id.unique_id));
        Self::write_json(&path, description)
    }

    async fn get_import_metadata(
        &self,
        project: &str,
        import_source_id: &str,
    ) -> Result<Option<ImportMetadata>> {
        let path = self.import_metadata_path(project, import_source_id);
        if !path.exists() {
            return Ok(None);
        }

        let content =
            tokio::fs::read_to_string(&path).await.map_err(|e| WerfError::io(&path, e))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn put_import_metadata(
        &self,
        project: &str,
        metadata: &ImportMetadata,
    ) -> Result<()> {
        let path = self.import_metadata_path(project, &metadata.import_source_id);
        Self::write_json(&path, metadata)
    }
}
