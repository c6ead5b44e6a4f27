//! Stages storage: the shared repository of built stage descriptions keyed
//! by digest, plus project-scoped import metadata.

use crate::error::Result;
use crate::image::StageDescription;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod fs;
pub mod memory;

pub use fs::FsStagesStorage;
pub use memory::MemoryStagesStorage;

/// Memoized result of a checksum container run for one import source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMetadata {
    /// Memoization key: source content digest + path filters.
    pub import_source_id: String,
    /// Image id of the source the checksum was computed inside.
    pub source_image_id: String,
    pub checksum: String,
}

/// The shared stages repository.
///
/// Reads are safe to run in parallel. Write-read ordering for import
/// metadata is enforced by the import coordinator, not here;
/// `put_import_metadata` is last-writer-wins (all writers compute the same
/// value for a given key).
#[async_trait]
pub trait StagesStorage: Send + Sync {
    /// All built stages recorded under `digest`, in no particular order.
    async fn get_stages_by_digest(
        &self,
        project: &str,
        digest: &str,
    ) -> Result<Vec<StageDescription>>;

    /// Record a built stage. Never retried: uniqueness comes from the
    /// digest + unique id.
    async fn put_stage(&self, project: &str, description: &StageDescription) -> Result<()>;

    async fn get_import_metadata(
        &self,
        project: &str,
        import_source_id: &str,
    ) -> Result<Option<ImportMetadata>>;

    async fn put_import_metadata(
        &self,
        project: &str,
        metadata: &ImportMetadata,
    ) -> Result<()>;
}
