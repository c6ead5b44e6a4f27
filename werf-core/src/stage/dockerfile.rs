//! The dockerfile stage: the degenerate single-stage path where the whole
//! image is expressed as an inline dockerfile.

use crate::config::DockerfileConfig;
use crate::digest::{sha256_hash, sha256_hex};
use crate::image::{DockerfileBuild, StageImage};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct DockerfileStage {
    content: Vec<u8>,
    build_args: BTreeMap<String, String>,
    target: Option<String>,
    context_digest: String,
}

impl DockerfileStage {
    pub fn from_config(config: &DockerfileConfig) -> Self {
        Self {
            content: config.content.as_bytes().to_vec(),
            build_args: config.build_args.clone(),
            target: config.target.clone(),
            context_digest: config.context_digest.clone(),
        }
    }

    /// Dockerfile bytes + build args + target + context content digest.
    pub fn get_dependencies(&self) -> String {
        let mut args = vec![sha256_hex(&self.content)];
        args.extend(self.build_args.iter().map(|(k, v)| format!("{}={}", k, v)));
        args.push(self.target.clone().unwrap_or_default());
        args.push(self.context_digest.clone());

        sha256_hash(&args)
    }

    pub fn prepare_image(&self, image: &mut StageImage) {
        image.dockerfile = Some(DockerfileBuild {
            content: self.content.clone(),
            build_args: self.build_args.clone(),
            target: self.target.clone(),
        });
    }
}
