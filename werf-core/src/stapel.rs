//! The stapel helper container: a long-lived container exposing static
//! binaries that service scripts (checksum runs, archive/patch application)
//! rely on inside arbitrary source images.

use crate::error::{Result, WerfError};
use crate::runtime::ContainerRuntime;
use std::path::Path;
use tracing::debug;

pub const STAPEL_IMAGE: &str = "ghcr.io/werf/stapel:0.6.1";

const STAPEL_VERSION: &str = "0.6.1";

/// Directory with the helper's static binaries, visible in any container
/// started with the helper's volumes.
pub const EMBEDDED_BIN_DIR: &str = "/.werf/stapel/embedded/bin";

/// Deterministic name of the helper container on a host.
pub fn container_name() -> String {
    format!("werf-stapel-{}", STAPEL_VERSION.replace('.', "-"))
}

fn bin_path(tool: &str) -> String {
    format!("{}/{}", EMBEDDED_BIN_DIR, tool)
}

pub fn bash_bin_path() -> String {
    bin_path("bash")
}

pub fn find_bin_path() -> String {
    bin_path("find")
}

pub fn sort_bin_path() -> String {
    bin_path("sort")
}

pub fn xargs_bin_path() -> String {
    bin_path("xargs")
}

pub fn md5sum_bin_path() -> String {
    bin_path("md5sum")
}

pub fn cut_bin_path() -> String {
    bin_path("cut")
}

pub fn git_bin_path() -> String {
    bin_path("git")
}

pub fn tar_bin_path() -> String {
    bin_path("tar")
}

pub fn install_bin_path() -> String {
    bin_path("install")
}

pub fn rsync_bin_path() -> String {
    bin_path("rsync")
}

/// Ensure the helper container exists, creating it from [`STAPEL_IMAGE`] on
/// first use. Returns the container name for `--volumes-from`.
pub async fn get_or_create_container(runtime: &dyn ContainerRuntime) -> Result<String> {
    let name = container_name();

    if runtime.inspect(&name).await?.is_some() {
        return Ok(name);
    }

    debug!(container = %name, image = STAPEL_IMAGE, "creating stapel helper container");
    runtime.pull(STAPEL_IMAGE).await?;
    runtime.from_command(&name, STAPEL_IMAGE).await?;

    Ok(name)
}

/// Write an executable service script running `commands` under the helper's
/// bash with errexit.
pub async fn create_script(path: &Path, commands: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| WerfError::io(parent, e))?;
    }

    let mut content = format!("#!{} -e\n\n", bash_bin_path());
    content.push_str(&commands.join("\n"));
    content.push('\n');

    tokio::fs::write(path, content).await.map_err(|e| WerfError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(path, perms).await.map_err(|e| WerfError::io(path, e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_paths_are_fixed() {
        assert_eq!(bash_bin_path(), "/.werf/stapel/embedded/bin/bash");
        assert_eq!(md5sum_bin_path(), "/.werf/stapel/embedded/bin/md5sum");
    }

    #[test]
    fn test_container_name_is_versioned() {
        assert_eq!(container_name(), "werf-stapel-0-6-1");
    }

    #[tokio::test]
    async fn test_create_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scripts").join("script.sh");

        create_script(&path, &["echo one".to_string(), "echo two".to_string()])
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with("#!/.werf/stapel/embedded/bin/bash -e\n"));
        assert!(content.contains("echo one\necho two"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
