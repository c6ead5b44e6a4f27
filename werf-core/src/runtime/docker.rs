//! External daemon driver over the `docker` CLI.
//!
//! The daemon has no long-lived build containers the way the native builder
//! does: `from_command` only records the container→image association, the
//! actual container materializes on the first `run_command` and is committed
//! from there.

use crate::error::{Result, WerfError};
use crate::runtime::{
    BuildFromDockerfileOpts, BuilderInfo, CommitOpts, ContainerRuntime, RmiOpts,
    RunCommandOpts, RunOpts,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Default)]
pub struct DockerRuntime {
    /// Build container name → base image, filled by `from_command`.
    pending_containers: Mutex<HashMap<String, String>>,
}

impl DockerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    async fn exec(args: &[String]) -> Result<String> {
        debug!(?args, "running docker");

        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|e| WerfError::runtime(format!("unable to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(WerfError::Runtime {
                reason: format!(
                    "docker {:?} failed: {}",
                    args,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn base_image_for(&self, container: &str) -> Result<String> {
        self.pending_containers
            .lock()
            .expect("pending containers lock poisoned")
            .get(container)
            .cloned()
            .ok_or_else(|| {
                WerfError::runtime(format!("unknown build container {}", container))
            })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, reference: &str) -> Result<()> {
        Self::exec(&["pull".into(), reference.into()]).await.map(|_| ())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        Self::exec(&["push".into(), reference.into()]).await.map(|_| ())
    }

    async fn tag(&self, reference: &str, new_reference: &str) -> Result<()> {
        Self::exec(&["tag".into(), reference.into(), new_reference.into()]).await.map(|_| ())
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
            "build".into(),
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

        Self::exec(&args).await?;

        let image_id = tokio::fs::read_to_string(&iid_path)
            .await
            .map_err(|e| WerfError::io(&iid_path, e))?;
        Ok(image_id.trim().to_string())
    }

    async fn run(&self, image: &str, command: &[String], opts: RunOpts) -> Result<()> {
        let mut args: Vec<String> = vec!["run".into()];
        if opts.remove {
            args.push("--rm".into());
        }
        if let Some(user) = &opts.user {
            args.push(format!("--user={}", user));
        }
        if let Some(workdir) = &opts.workdir {
            args.push(format!("--workdir={}", workdir));
        }
        if let Some(entrypoint) = &opts.entrypoint {
            args.push(format!("--entrypoint={}", entrypoint));
        }
        for from in &opts.volumes_from {
            args.push(format!("--volumes-from={}", from));
        }
        for volume in &opts.volumes {
            args.push(format!("--volume={}", volume));
        }
        args.push(image.into());
        args.extend(command.iter().cloned());

        Self::exec(&args).await.map(|_| ())
    }

    async fn run_command(
        &self,
        container: &str,
        command: &[String],
        opts: RunCommandOpts,
    ) -> Result<()> {
        let image = self.base_image_for(container)?;

        let mut args: Vec<String> =
            vec!["run".into(), format!("--name={}", container)];
        for mount in &opts.mounts {
            let mut spec =
                format!("type=bind,src={},dst={}", mount.source, mount.destination);
            if mount.read_only {
                spec.push_str(",ro");
            }
            args.push(format!("--mount={}", spec));
        }
        for volume in &opts.volumes {
            args.push(format!("--volume={}", volume));
        }
        args.push(image);
        args.push("/bin/sh".into());
        args.push("-ec".into());
        args.push(command.join("\n"));
        args.extend(opts.args.iter().cloned());

        Self::exec(&args).await.map(|_| ())
    }

    async fn from_command(&self, container: &str, image: &str) -> Result<String> {
        self.pending_containers
            .lock()
            .expect("pending containers lock poisoned")
            .insert(container.to_string(), image.to_string());
        Ok(container.to_string())
    }

    async fn commit(&self, container: &str, opts: CommitOpts) -> Result<String> {
        let mut args: Vec<String> = vec!["commit".into()];
        for (key, value) in &opts.labels {
            args.push("--change".into());
            args.push(format!("LABEL {}={}", key, value));
        }

        let i = &opts.instructions;
        for volume in &i.volume {
            args.push("--change".into());
            args.push(format!("VOLUME {}", volume));
        }
        for port in &i.expose {
            args.push("--change".into());
            args.push(format!("EXPOSE {}", port));
        }
        for (key, value) in &i.env {
            args.push("--change".into());
            args.push(format!("ENV {}={}", key, value));
        }
        for (key, value) in &i.label {
            args.push("--change".into());
            args.push(format!("LABEL {}={}", key, value));
        }
        if !i.cmd.is_empty() {
            args.push("--change".into());
            args.push(format!("CMD {}", serde_json::to_string(&i.cmd)?));
        }
        if !i.entrypoint.is_empty() {
            args.push("--change".into());
            args.push(format!("ENTRYPOINT {}", serde_json::to_string(&i.entrypoint)?));
        }
        if !i.workdir.is_empty() {
            args.push("--change".into());
            args.push(format!("WORKDIR {}", i.workdir));
        }
        if !i.user.is_empty() {
            args.push("--change".into());
            args.push(format!("USER {}", i.user));
        }
        if !i.healthcheck.is_empty() {
            args.push("--change".into());
            args.push(format!("HEALTHCHECK {}", i.healthcheck));
        }

        args.push(container.into());

        Self::exec(&args).await
    }

    async fn rm(&self, container: &str) -> Result<()> {
        self.pending_containers
            .lock()
            .expect("pending containers lock poisoned")
            .remove(container);
        Self::exec(&["rm".into(), "--force".into(), container.into()]).await.map(|_| ())
    }

    async fn inspect(&self, reference: &str) -> Result<Option<BuilderInfo>> {
        let output = Command::new("docker")
            .args(["inspect", reference])
            .output()
            .await
            .map_err(|e| WerfError::runtime(format!("unable to run docker: {}", e)))?;

        if !output.status.success() {
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        let entry = match value.as_array().and_then(|a| a.first()) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let id = entry.get("Id").and_then(|v| v.as_str()).unwrap_or_default().to_string();

        let mut labels = HashMap::new();
        if let Some(map) =
            entry.pointer("/Config/Labels").and_then(|v| v.as_object())
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
        Self::exec(&args).await.map(|_| ())
    }

    async fn mount(&self, _container: &str) -> Result<PathBuf> {
        Err(WerfError::runtime("rootfs mount is not supported by the daemon driver"))
    }

    async fn umount(&self, _container: &str) -> Result<()> {
        Err(WerfError::runtime("rootfs umount is not supported by the daemon driver"))
    }
}
