//! User command stages: beforeInstall, install, beforeSetup, setup.

use crate::digest::sha256_hash;
use crate::image::StageImage;

#[derive(Debug)]
pub struct UserCommandsStage {
    commands: Vec<String>,
    cache_version: Option<String>,
}

impl UserCommandsStage {
    pub fn new(commands: Vec<String>, cache_version: Option<String>) -> Self {
        Self { commands, cache_version }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get_dependencies(&self) -> String {
        let mut args = Vec::new();
        if let Some(version) = &self.cache_version {
            args.push(version.clone());
        }
        args.extend(self.commands.iter().cloned());
        sha256_hash(&args)
    }

    pub fn prepare_image(&self, image: &mut StageImage) {
        image.run_commands.extend(self.commands.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependencies_change_with_commands() {
        let a = UserCommandsStage::new(vec!["apk add curl".into()], None);
        let b = UserCommandsStage::new(vec!["apk add wget".into()], None);
        assert_ne!(a.get_dependencies(), b.get_dependencies());
    }

    #[test]
    fn test_dependencies_change_with_cache_version() {
        let a = UserCommandsStage::new(vec!["make".into()], None);
        let b = UserCommandsStage::new(vec!["make".into()], Some("2".into()));
        assert_ne!(a.get_dependencies(), b.get_dependencies());
    }

    #[test]
    fn test_empty_without_commands() {
        assert!(UserCommandsStage::new(vec![], None).is_empty());
        assert!(!UserCommandsStage::new(vec!["true".into()], None).is_empty());
    }
}
