//! In-memory stages storage, for tests and ephemeral runs.

use crate::error::Result;
use crate::image::StageDescription;
use crate::storage::{ImportMetadata, StagesStorage};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryStagesStorage {
    stages: RwLock<HashMap<(String, String), Vec<StageDescription>>>,
    import_metadata: RwLock<HashMap<(String, String), ImportMetadata>>,
}

impl MemoryStagesStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of recorded stages, across digests.
    pub async fn stage_count(&self) -> usize {
        self.stages.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl StagesStorage for MemoryStagesStorage {
    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>> {
        Ok(self
            .stages
            .read()
            .await
            .get(&(project.to_string(), digest.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn put_stage(&self, project: &str, description: &StageDescription) -> Result<()> {
        self.stages
            .write()
            .await
            .entry((project.to_string(), description.stage_id.digest.clone()))
            .or_default()
            .push(description.clone());
        Ok(())
    }

    async fn get_import_metadata(
        &self,
        project: &str,
        import_source_id: &str,
    ) -> Result<Option<ImportMetadata>> {
        Ok(self
            .import_metadata
            .read()
            .await
            .get(&(project.to_string(), import_source_id.to_string()))
            .cloned())
    }

    async fn put_import_metadata(
        &self,
        project: &str,
        metadata: &ImportMetadata,
    ) -> Result<()> {
        self.import_metadata
            .write()
            .await
            .insert((project.to_string(), metadata.import_source_id.clone()), metadata.clone());
        Ok(())
    }
}
