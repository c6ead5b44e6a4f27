//! Abstract container runtime.
//!
//! The pipeline never talks to a builder directly; everything goes through
//! the [`ContainerRuntime`] trait. Two drivers ship in-tree: a native OCI
//! builder over the `buildah` CLI and an external daemon driver over the
//! `docker` CLI.

use crate::error::{Result, WerfError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

pub mod buildah;
pub mod docker;

pub use buildah::BuildahRuntime;
pub use docker::DockerRuntime;

/// Env var selecting the native builder's isolation.
pub const BUILDAH_ISOLATION_ENV: &str = "WERF_CONTAINER_RUNTIME_BUILDAH_ISOLATION";

/// Env var selecting the native builder's storage driver.
pub const BUILDAH_STORAGE_DRIVER_ENV: &str = "WERF_CONTAINER_RUNTIME_BUILDAH_STORAGE_DRIVER";

/// Execution boundary for the native builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
    Chroot,
    OciRootless,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Chroot => write!(f, "chroot"),
            Isolation::OciRootless => write!(f, "oci-rootless"),
        }
    }
}

/// Storage driver for the native builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageDriver {
    Overlay,
    Vfs,
}

pub const DEFAULT_STORAGE_DRIVER: StorageDriver = StorageDriver::Overlay;

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageDriver::Overlay => write!(f, "overlay"),
            StorageDriver::Vfs => write!(f, "vfs"),
        }
    }
}

/// Whether the current process runs inside a container.
pub fn is_in_container() -> bool {
    std::path::Path::new("/.dockerenv").exists()
        || std::path::Path::new("/run/.containerenv").exists()
}

/// Isolation to use when nothing was requested.
pub fn default_isolation(in_container: bool) -> Isolation {
    if in_container {
        Isolation::Chroot
    } else {
        Isolation::OciRootless
    }
}

/// Parse the isolation selection. Rootless isolation is invalid inside a
/// container.
pub fn parse_isolation(raw: &str, in_container: bool) -> Result<Isolation> {
    match raw {
        "rootless" | "oci-rootless" => {
            if in_container {
                return Err(WerfError::EnvironmentUnsupported {
                    reason: "rootless isolation is not available inside a container".to_string(),
                });
            }
            Ok(Isolation::OciRootless)
        }
        "chroot" => Ok(Isolation::Chroot),
        "default" | "" => Ok(default_isolation(in_container)),
        other => Err(WerfError::UserConfig {
            reason: format!("unexpected isolation specified: {}", other),
        }),
    }
}

/// Isolation from [`BUILDAH_ISOLATION_ENV`].
pub fn isolation_from_env() -> Result<Isolation> {
    let raw = std::env::var(BUILDAH_ISOLATION_ENV).unwrap_or_default();
    parse_isolation(&raw, is_in_container())
}

/// Parse the storage driver selection. Unset/default resolves to overlay.
pub fn parse_storage_driver(raw: &str) -> Result<StorageDriver> {
    match raw {
        "overlay" => Ok(StorageDriver::Overlay),
        "vfs" => Ok(StorageDriver::Vfs),
        "default" | "" => Ok(DEFAULT_STORAGE_DRIVER),
        other => Err(WerfError::UserConfig {
            reason: format!("unexpected storage driver specified: {}", other),
        }),
    }
}

/// Storage driver from [`BUILDAH_STORAGE_DRIVER_ENV`].
pub fn storage_driver_from_env() -> Result<StorageDriver> {
    let raw = std::env::var(BUILDAH_STORAGE_DRIVER_ENV).unwrap_or_default();
    parse_storage_driver(&raw)
}

/// Inspection result for an image or container reference.
#[derive(Debug, Clone, Default)]
pub struct BuilderInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// A bind mount honored while running a command inside a build container.
#[derive(Debug, Clone)]
pub struct RunMount {
    pub source: String,
    pub destination: String,
    pub read_only: bool,
}

/// Options for [`ContainerRuntime::run_command`].
#[derive(Debug, Clone, Default)]
pub struct RunCommandOpts {
    pub args: Vec<String>,
    pub mounts: Vec<RunMount>,
    /// `host:container` volume bindings.
    pub volumes: Vec<String>,
}

/// Options for [`ContainerRuntime::run`] (one-shot image runs).
#[derive(Debug, Clone, Default)]
pub struct RunOpts {
    /// Remove the container after the run.
    pub remove: bool,
    pub user: Option<String>,
    pub workdir: Option<String>,
    pub entrypoint: Option<String>,
    pub volumes: Vec<String>,
    pub volumes_from: Vec<String>,
}

/// Options for [`ContainerRuntime::build_from_dockerfile`].
#[derive(Debug, Clone, Default)]
pub struct BuildFromDockerfileOpts {
    /// Tar archive with the build context.
    pub context_tar: Option<PathBuf>,
    pub build_args: BTreeMap<String, String>,
    pub target: Option<String>,
}

/// Options for [`ContainerRuntime::commit`].
#[derive(Debug, Clone, Default)]
pub struct CommitOpts {
    pub labels: BTreeMap<String, String>,
    /// Docker-style config directives committed alongside the labels.
    pub instructions: crate::config::DockerInstructionsConfig,
}

/// Options for [`ContainerRuntime::rmi`].
#[derive(Debug, Clone, Default)]
pub struct RmiOpts {
    pub force: bool,
}

/// The driver actually executing pulls, runs and commits.
///
/// Implementations are injected into the conveyor; there is no process-wide
/// runtime handle.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, reference: &str) -> Result<()>;

    async fn push(&self, reference: &str) -> Result<()>;

    async fn tag(&self, reference: &str, new_reference: &str) -> Result<()>;

    /// Build an image from an inline dockerfile; returns the image id.
    async fn build_from_dockerfile(
        &self,
        dockerfile: &[u8],
        opts: BuildFromDockerfileOpts,
    ) -> Result<String>;

    /// One-shot run of `image` with `command`, used for service containers
    /// such as the import checksum run.
    async fn run(&self, image: &str, command: &[String], opts: RunOpts) -> Result<()>;

    /// Run a command inside a build container created by [`from_command`].
    ///
    /// [`from_command`]: ContainerRuntime::from_command
    async fn run_command(
        &self,
        container: &str,
        command: &[String],
        opts: RunCommandOpts,
    ) -> Result<()>;

    /// Create a named build container from `image`; returns the container id.
    async fn from_command(&self, container: &str, image: &str) -> Result<String>;

    /// Commit a build container into an image; returns the image id.
    async fn commit(&self, container: &str, opts: CommitOpts) -> Result<String>;

    /// Remove a build container.
    async fn rm(&self, container: &str) -> Result<()>;

    async fn inspect(&self, reference: &str) -> Result<Option<BuilderInfo>>;

    async fn rmi(&self, reference: &str, opts: RmiOpts) -> Result<()>;

    /// Mount a container's rootfs on the host; returns the mountpoint.
    async fn mount(&self, container: &str) -> Result<PathBuf>;

    async fn umount(&self, container: &str) -> Result<()>;
}
