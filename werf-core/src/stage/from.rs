//! The `from` stage: seeds the pipeline with the base image.
//!
//! Its digest depends on the base image reference and the resolved base
//! image content identity, so a re-tagged base re-keys every stage built on
//! top of it.

use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::image::StageImage;
use crate::stage::StageServices;

#[derive(Debug)]
pub struct FromStage {
    base_image: String,
    cache_version: Option<String>,
}

impl FromStage {
    pub fn new(base_image: String, cache_version: Option<String>) -> Self {
        Self { base_image, cache_version }
    }

    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    pub async fn get_dependencies(&self, services: &StageServices<'_>) -> Result<String> {
        let info = match services.runtime.inspect(&self.base_image).await? {
            Some(info) => info,
            None => {
                // not local yet: fetch, then resolve
                services.runtime.pull(&self.base_image).await?;
                services.runtime.inspect(&self.base_image).await?.ok_or_else(|| {
                    WerfError::runtime(format!(
                        "base image {} not found after pull",
                        self.base_image
                    ))
                })?
            }
        };

        let mut args = Vec::new();
        if let Some(version) = &self.cache_version {
            args.push(version.clone());
        }
        args.push(self.base_image.clone());
        args.push(info.id);

        Ok(sha256_hash(&args))
    }

    pub fn prepare_image(&self, image: &mut StageImage) {
        image.from_image = Some(self.base_image.clone());
    }
}
