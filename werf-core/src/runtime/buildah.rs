//! Native OCI builder driver over the `buildah` CLI.

use crate::error::{Result, WerfError};
use crate::runtime::{
    isolation_from_env, storage_driver_from_env, BuildFromDockerfileOpts, BuilderInfo,
    CommitOpts, ContainerRuntime, Isolation, RmiOpts, RunCommandOpts, RunOpts, StorageDriver,
};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// Drives `buildah` with a fixed isolation and storage driver.
#[derive(Debug)]
pub struct BuildahRuntime {
    isolation: Isolation,
    storage_driver: StorageDriver,
}

impl BuildahRuntime {
    pub fn new(isolation: Isolation, storage_driver: StorageDriver) -> Self {
        Self { isolation, storage_driver }
    }

    /// Construct from the `WERF_CONTAINER_RUNTIME_BUILDAH_*` environment.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(isolation_from_env()?, storage_driver_from_env()?))
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn storage_driver(&self) -> StorageDriver {
        self.storage_driver
    }

    async fn exec(&self, args: &[String]) -> Result<String> {
        debug!(?args, "running buildah");

        let output = Command::new("buildah")
            .arg("--storage-driver")
            .arg(self.storage_driver.to_string())
            .args(args)
            .output()
            .await
            .map_err(|e| WerfError::runtime(format!("unable to run buildah: {}", e)))?;

        if !output.status.success() {
            return Err(WerfError::Runtime {
                reason: format!(
                    "buildah {:?} failed: {}",
                    args,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for BuildahRuntime {
    async fn pull(&self, reference: &str) -> Result<()> {
        self.exec(&["pull".into(), reference.into()]).await.map(|_| ())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        self.exec(&["push".into(), reference.into()]).await.map(|_| ())
    }

    async fn tag(&self, reference: &str, new_reference: &str) -> Result<()> {
        self.exec(&["tag".into(), reference.into(), new_reference.into()]).await.map(|_| ())
    }

    async fn build_from_dockerfile(
        &self,
        dockerfile: &[u8],
        opts: BuildFromDockerfileOpts,
    ) -> Result<String> {
        let session = tempfile::tempdir()
            .map_err(|e| WerfError::runtime(format!("unable to create session dir: {}", e)))?;

        let dockerfile_path = session.path().join("Dockerfile");
        tokio::fs::write(&dockerfile_path, dockerfile)
            .await
            .map_err(|e| WerfError::io(&dockerfile_path, e))?;

        let context_dir = session.path().join("context");
        tokio::fs::create_dir_all(&context_dir)
            .await
            .map_err(|e| WerfError::io(&context_dir, e))?;

        if let Some(tar_path) = &opts.context_tar {
            let status = Command::new("tar")
                .arg("-xf")
                .arg(tar_path)
                .arg("-C")
                .arg(&context_dir)
                .status()
                .await
                .map_err(|e| WerfError::runtime(format!("unable to extract context: {}", e)))?;
            if !status.success() {
                return Err(WerfError::runtime("context tar extraction failed"));
            }
        }

        let iid_path = session.path().join("iid");

        let mut args: Vec<String> = vec![
            "bud".into(),
            "--isolation".into(),
            self.isolation.to_string(),
            "-f".into(),
            dockerfile_path.to_string_lossy().into_owned(),
            "--iidfile".into(),
            iid_path.to_string_lossy().into_owned(),
        ];
        for (key, value) in &opts.build_args {
            args.push("--build-arg".into());
            args.push(format!("{}={}", key, value));
        }
        if let Some(target) = &opts.target {
            args.push("--target".into());
            args.push(target.clone());
        }
        args.push(context_dir.to_string_lossy().into_owned());

        self.exec(&args).await?;

        let image_id = tokio::fs::read_to_string(&iid_path)
            .await
            .map_err(|e| WerfError::io(&iid_path, e))?;
        Ok(image_id.trim().to_string())
    }

    async fn run(&self, image: &str, command: &[String], opts: RunOpts) -> Result<()> {
        // buildah has no one-shot run; emulate with from/run/rm
        let container = format!("werf-run-{}", uuid::Uuid::new_v4());
        self.from_command(&container, image).await?;

        let mut args: Vec<String> = vec![
            "run".into(),
            "--isolation".into(),
            self.isolation.to_string(),
        ];
        if let Some(user) = &opts.user {
            args.push("--user".into());
            args.push(user.clone());
        }
        if let Some(workdir) = &opts.workdir {
            args.push("--workingdir".into());
            args.push(workdir.clone());
        }
        for volume in &opts.volumes {
            args.push("--volume".into());
            args.push(volume.clone());
        }
        for from in &opts.volumes_from {
            args.push("--volumes-from".into());
            args.push(from.clone());
        }
        args.push(container.clone());
        args.push("--".into());
        if let Some(entrypoint) = &opts.entrypoint {
            args.push(entrypoint.clone());
        }
        args.extend(command.iter().cloned());

        let run_result = self.exec(&args).await;

        if opts.remove {
            if let Err(e) = self.rm(&container).await {
                warn!(container = %container, "failed to remove run container: {}", e);
            }
        }

        run_result.map(|_| ())
    }

    async fn run_command(
        &self,
        container: &str,
        command: &[String],
        opts: RunCommandOpts,
    ) -> Result<()> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--isolation".into(),
            self.isolation.to_string(),
        ];
        for mount in &opts.mounts {
            let mut spec =
                format!("type=bind,src={},dst={}", mount.source, mount.destination);
            if mount.read_only {
                spec.push_str(",ro");
            }
            args.push("--mount".into());
            args.push(spec);
        }
        for volume in &opts.volumes {
            args.push("--volume".into());
            args.push(volume.clone());
        }
        args.push(container.into());
        args.push("--".into());
        args.extend(command.iter().cloned());
        args.extend(opts.args.iter().cloned());

        self.exec(&args).await.map(|_| ())
    }

    async fn from_command(&self, container: &str, image: &str) -> Result<String> {
        self.exec(&["from".into(), "--name".into(), container.into(), image.into()]).await
    }

    async fn commit(&self, container: &str, opts: CommitOpts) -> Result<String> {
        let mut config_args: Vec<String> = vec!["config".into()];
        for (key, value) in &opts.labels {
            config_args.push("--label".into());
            config_args.push(format!("{}={}", key, value));
        }

        let i = &opts.instructions;
        for volume in &i.volume {
            config_args.push("--volume".into());
            config_args.push(volume.clone());
        }
        for port in &i.expose {
            config_args.push("--port".into());
            config_args.push(port.clone());
        }
        for (key, value) in &i.env {
            config_args.push("--env".into());
            config_args.push(format!("{}={}", key, value));
        }
        for (key, value) in &i.label {
            config_args.push("--label".into());
            config_args.push(format!("{}={}", key, value));
        }
        if !i.cmd.is_empty() {
            config_args.push("--cmd".into());
            config_args.push(i.cmd.join(" "));
        }
        if !i.entrypoint.is_empty() {
            config_args.push("--entrypoint".into());
            config_args.push(serde_json::to_string(&i.entrypoint)?);
        }
        if !i.workdir.is_empty() {
            config_args.push("--workingdir".into());
            config_args.push(i.workdir.clone());
        }
        if !i.user.is_empty() {
            config_args.push("--user".into());
            config_args.push(i.user.clone());
        }
        if !i.healthcheck.is_empty() {
            config_args.push("--healthcheck".into());
            config_args.push(i.healthcheck.clone());
        }

        if config_args.len() > 1 {
            config_args.push(container.into());
            self.exec(&config_args).await?;
        }

        self.exec(&["commit".into(), container.into()]).await
    }

    async fn rm(&self, container: &str) -> Result<()> {
        self.exec(&["rm".into(), container.into()]).await.map(|_| ())
    }

    async fn inspect(&self, reference: &str) -> Result<Option<BuilderInfo>> {
        let output = Command::new("buildah")
            .arg("--storage-driver")
            .arg(self.storage_driver.to_string())
            .arg("inspect")
            .arg(reference)
            .output()
            .await
            .map_err(|e| WerfError::runtime(format!("unable to run buildah: {}", e)))?;

        if !output.status.success() {
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let id = value
            .get("FromImageID")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let mut labels = std::collections::HashMap::new();
        if let Some(map) = value
            .pointer("/Docker/config/Labels")
            .or_else(|| value.pointer("/OCIv1/config/Labels"))
            .and_then(|v| v.as_object())
        {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    labels.insert(k.clone(), s.to_string());
                }
            }
        }

        Ok(Some(BuilderInfo { id, labels }))
    }

    async fn rmi(&self, reference: &str, opts: RmiOpts) -> Result<()> {
        let mut args: Vec<String> = vec!["rmi".into()];
        if opts.force {
            args.push("--force".into());
        }
        args.push(reference.into());
        self.exec(&args).await.map(|_| ())
    }

    async fn mount(&self, container: &str) -> Result<PathBuf> {
        self.exec(&["mount".into(), container.into()]).await.map(PathBuf::from)
    }

    async fn umount(&self, container: &str) -> Result<()> {
        self.exec(&["umount".into(), container.into()]).await.map(|_| ())
    }
}
