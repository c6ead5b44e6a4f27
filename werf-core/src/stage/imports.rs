//! Imports stages: before/after × install/setup.
//!
//! The digest folds each import's memoized source checksum plus its
//! placement, so a consumer re-keys when the imported content or where it
//! lands changes, and only then.

use crate::config::{ImageConfig, ImportConfig};
use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::image::{StageImage, IMPORT_CHECKSUM_LABEL_PREFIX};
use crate::import::{ImportCoordinator, ImportSource};
use crate::stage::{Stage, StageName, StageServices};

#[derive(Debug)]
pub struct ImportsStage {
    imports: Vec<ImportConfig>,
}

impl ImportsStage {
    /// Imports landing before `stage` (install or setup).
    pub fn before(image: &ImageConfig, stage: StageName) -> Self {
        Self {
            imports: image
                .imports
                .iter()
                .filter(|import| import.before == stage.as_str())
                .cloned()
                .collect(),
        }
    }

    /// Imports landing after `stage` (install or setup).
    pub fn after(image: &ImageConfig, stage: StageName) -> Self {
        Self {
            imports: image
                .imports
                .iter()
                .filter(|import| import.after == stage.as_str())
                .cloned()
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.imports.is_empty()
    }

    pub async fn get_dependencies(
        &self,
        stage: &Stage,
        services: &StageServices<'_>,
    ) -> Result<String> {
        let mut args = Vec::new();

        for (index, import) in self.imports.iter().enumerate() {
            let source = resolve_source(services, import)?;

            let checksum = services
                .imports
                .source_checksum(stage.name(), import, &source)
                .await
                .map_err(|e| WerfError::StageFailed {
                    image: stage.image_name().to_string(),
                    stage: stage.name().to_string(),
                    reason: format!("unable to get import {} source checksum: {}", index, e),
                })?;

            args.push(checksum);
            args.push(import.to.clone());
            args.push(import.group.clone());
            args.push(import.owner.clone());
        }

        Ok(sha256_hash(&args))
    }

    pub async fn prepare_image(
        &self,
        stage: &Stage,
        services: &StageServices<'_>,
        image: &mut StageImage,
    ) -> Result<()> {
        for import in &self.imports {
            let source = resolve_source(services, import)?;

            let server = services.lookup.import_server(&source.image_name);
            image.add_service_run_command(server.copy_command(import));

            let import_source_id =
                ImportCoordinator::import_source_id(import, &source.content_digest);
            let metadata = services.imports.cached_metadata(&import_source_id).await?;

            // the hash phase wrote this metadata; observing a miss here is a
            // programming error, not an error path
            let metadata = match metadata {
                Some(metadata) => metadata,
                None => panic!("import metadata {} not found", import_source_id),
            };

            let label_key = format!(
                "{}{}",
                IMPORT_CHECKSUM_LABEL_PREFIX,
                ImportCoordinator::import_id(import)
            );
            image.add_label(label_key, metadata.checksum);
        }

        Ok(())
    }
}

/// Resolve the import's source image facts from the wider build plan. The
/// conveyor's topological ordering guarantees the source was already built.
fn resolve_source(
    services: &StageServices<'_>,
    import: &ImportConfig,
) -> Result<ImportSource> {
    let source_name = import.source_name();
    let lookup = services.lookup;

    let missing = || WerfError::UnknownImage { image: source_name.to_string() };

    if import.stage.is_empty() {
        Ok(ImportSource {
            image_name: lookup
                .image_name_for_last_image_stage(source_name)
                .ok_or_else(missing)?,
            image_id: lookup.image_id_for_last_image_stage(source_name).ok_or_else(missing)?,
            content_digest: lookup.image_content_digest(source_name).ok_or_else(missing)?,
        })
    } else {
        let stage = StageName::parse(&import.stage).ok_or_else(|| WerfError::UserConfig {
            reason: format!("unknown import stage {:?}", import.stage),
        })?;

        Ok(ImportSource {
            image_name: lookup
                .image_name_for_image_stage(source_name, stage)
                .ok_or_else(missing)?,
            image_id: lookup
                .image_id_for_image_stage(source_name, stage)
                .ok_or_else(missing)?,
            content_digest: lookup
                .image_stage_content_digest(source_name, stage)
                .ok_or_else(missing)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with_imports() -> ImageConfig {
        ImageConfig {
            name: "app".into(),
            imports: vec![
                ImportConfig {
                    image_name: "builder".into(),
                    add: "/out".into(),
                    to: "/app".into(),
                    before: "install".into(),
                    ..Default::default()
                },
                ImportConfig {
                    image_name: "assets".into(),
                    add: "/dist".into(),
                    to: "/static".into(),
                    after: "setup".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_imports_partition_by_target_stage() {
        let image = image_with_imports();

        assert_eq!(ImportsStage::before(&image, StageName::Install).imports.len(), 1);
        assert!(ImportsStage::after(&image, StageName::Install).is_empty());
        assert!(ImportsStage::before(&image, StageName::Setup).is_empty());
        assert_eq!(ImportsStage::after(&image, StageName::Setup).imports.len(), 1);
    }
}
