//! The dockerInstructions stage: folds declared Docker-style config
//! directives into the final image.

use crate::config::DockerInstructionsConfig;
use crate::digest::sha256_hash;
use crate::image::StageImage;

#[derive(Debug)]
pub struct DockerInstructionsStage {
    instructions: DockerInstructionsConfig,
}

impl DockerInstructionsStage {
    pub fn new(instructions: DockerInstructionsConfig) -> Self {
        Self { instructions }
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Directives folded in a canonical fixed order; map-valued directives
    /// are iterated sorted by key.
    pub fn get_dependencies(&self) -> String {
        let i = &self.instructions;
        let mut args: Vec<String> = Vec::new();

        args.extend(i.volume.iter().cloned());
        args.extend(i.expose.iter().cloned());
        args.extend(i.env.iter().map(|(k, v)| format!("{}={}", k, v)));
        args.extend(i.label.iter().map(|(k, v)| format!("{}={}", k, v)));
        args.extend(i.cmd.iter().cloned());
        args.extend(i.entrypoint.iter().cloned());
        args.push(i.workdir.clone());
        args.push(i.user.clone());
        args.push(i.healthcheck.clone());

        sha256_hash(&args)
    }

    pub fn prepare_image(&self, image: &mut StageImage) {
        image.instructions = self.instructions.clone();
    }
}
