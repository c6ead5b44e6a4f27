//! Cross-image import coordination.
//!
//! Imports are keyed by what they copy, not where they land: the
//! `import_source_id` hashes the source image's content digest plus the path
//! filters, and the resulting file-tree checksum is memoized in the stages
//! storage so identical imports never recompute. The checksum itself is
//! produced inside a container running the source image with the stapel
//! helper's static binaries.

use crate::config::ImportConfig;
use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::paths::{join_unix_path, CONTAINER_SERVICE_DIR};
use crate::runtime::{ContainerRuntime, RunOpts};
use crate::stage::StageName;
use crate::stapel;
use crate::storage::{ImportMetadata, StagesStorage};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Env hook: log the full checksum-container invocation.
const DEBUG_IMPORT_SOURCE_CHECKSUM_ENV: &str = "WERF_DEBUG_IMPORT_SOURCE_CHECKSUM";

/// Resolved facts about an import's source image.
#[derive(Debug, Clone)]
pub struct ImportSource {
    /// Image name the runtime can run.
    pub image_name: String,
    /// Runtime image id.
    pub image_id: String,
    /// The source's content digest; part of the memoization key.
    pub content_digest: String,
}

/// Supplies the runtime-specific copy command an imports stage appends to
/// the target image spec. An external collaborator; the in-tree default
/// copies with the stapel helper's rsync.
pub trait ImportServer: Send + Sync {
    fn copy_command(&self, import: &ImportConfig) -> String;
}

/// Default [`ImportServer`] built on the stapel helper binaries.
#[derive(Debug, Default)]
pub struct StapelImportServer;

impl ImportServer for StapelImportServer {
    fn copy_command(&self, import: &ImportConfig) -> String {
        let mut command = format!("{} --archive --links --inplace", stapel::rsync_bin_path());

        if !import.owner.is_empty() || !import.group.is_empty() {
            command.push_str(&format!(" --chown={}:{}", import.owner, import.group));
        }
        for include in &import.include_paths {
            command.push_str(&format!(" --include=\"{}\"", include));
        }
        for exclude in &import.exclude_paths {
            command.push_str(&format!(" --exclude=\"{}\"", exclude));
        }

        command.push_str(&format!(" \"{}/\" \"{}/\"", import.add, import.to));
        command
    }
}

/// Per-source-id locks serializing checksum generation. Shared by every
/// coordinator of one build, so concurrent builds of identical imports run
/// exactly one checksum container.
#[derive(Debug, Default)]
pub struct ImportChecksumLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImportChecksumLocks {
    async fn lock_for(&self, import_source_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(import_source_id.to_string()).or_default().clone()
    }
}

/// Computes, memoizes and hands out import source checksums.
pub struct ImportCoordinator {
    project_name: String,
    image_tmp_dir: PathBuf,
    storage: Arc<dyn StagesStorage>,
    runtime: Arc<dyn ContainerRuntime>,
    generation_locks: Arc<ImportChecksumLocks>,
}

impl ImportCoordinator {
    pub fn new(
        project_name: impl Into<String>,
        image_tmp_dir: impl Into<PathBuf>,
        storage: Arc<dyn StagesStorage>,
        runtime: Arc<dyn ContainerRuntime>,
        generation_locks: Arc<ImportChecksumLocks>,
    ) -> Self {
        Self {
            project_name: project_name.into(),
            image_tmp_dir: image_tmp_dir.into(),
            storage,
            runtime,
            generation_locks,
        }
    }

    /// Identity of one import entry; suffixes the checksum label key on the
    /// produced image.
    pub fn import_id(import: &ImportConfig) -> String {
        let include_paths = import.include_paths.join("///");
        let exclude_paths = import.exclude_paths.join("///");
        sha256_hash(&[
            "ImageName",
            import.image_name.as_str(),
            "ArtifactName",
            import.artifact_name.as_str(),
            "Stage",
            import.stage.as_str(),
            "After",
            import.after.as_str(),
            "Before",
            import.before.as_str(),
            "Add",
            import.add.as_str(),
            "To",
            import.to.as_str(),
            "Group",
            import.group.as_str(),
            "Owner",
            import.owner.as_str(),
            "IncludePaths",
            include_paths.as_str(),
            "ExcludePaths",
            exclude_paths.as_str(),
        ])
    }

    /// Memoization key: identical source content + same path filters yield
    /// the same checksum.
    pub fn import_source_id(import: &ImportConfig, source_content_digest: &str) -> String {
        let include_paths = import.include_paths.join("///");
        let exclude_paths = import.exclude_paths.join("///");
        sha256_hash(&[
            "SourceImageContentDigest",
            source_content_digest,
            "Add",
            import.add.as_str(),
            "IncludePaths",
            include_paths.as_str(),
            "ExcludePaths",
            exclude_paths.as_str(),
        ])
    }

    /// Already-memoized metadata for a source id, if any.
    pub async fn cached_metadata(
        &self,
        import_source_id: &str,
    ) -> Result<Option<ImportMetadata>> {
        self.storage.get_import_metadata(&self.project_name, import_source_id).await
    }

    /// The checksum for one import's source tree: cache hit from the stages
    /// storage, or computed inside the checksum container and persisted
    /// before returning (write-before-read for later phases).
    pub async fn source_checksum(
        &self,
        stage_name: StageName,
        import: &ImportConfig,
        source: &ImportSource,
    ) -> Result<String> {
        let import_source_id = Self::import_source_id(import, &source.content_digest);

        if let Some(metadata) = self.cached_metadata(&import_source_id).await? {
            debug!(import_source_id = %import_source_id, "import checksum cache hit");
            return Ok(metadata.checksum);
        }

        let lock = self.generation_locks.lock_for(&import_source_id).await;
        let _guard = lock.lock().await;

        // lost the race: another task generated while we waited
        if let Some(metadata) = self.cached_metadata(&import_source_id).await? {
            return Ok(metadata.checksum);
        }

        let checksum =
            self.generate_checksum(stage_name, import, source, &import_source_id).await?;

        let metadata = ImportMetadata {
            import_source_id: import_source_id.clone(),
            source_image_id: source.image_id.clone(),
            checksum: checksum.clone(),
        };
        self.storage.put_import_metadata(&self.project_name, &metadata).await?;

        info!(import_source_id = %import_source_id, "import checksum computed");
        Ok(checksum)
    }

    async fn generate_checksum(
        &self,
        stage_name: StageName,
        import: &ImportConfig,
        source: &ImportSource,
        import_source_id: &str,
    ) -> Result<String> {
        let stapel_container = stapel::get_or_create_container(self.runtime.as_ref()).await?;

        let host_dir = self
            .image_tmp_dir
            .join(stage_name.as_str())
            .join("imports")
            .join(import_source_id);
        tokio::fs::create_dir_all(&host_dir)
            .await
            .map_err(|e| WerfError::io(&host_dir, e))?;

        let script_host_path = host_dir.join("script.sh");
        let checksum_host_path = host_dir.join("checksum");
        let script_container_path = join_unix_path(CONTAINER_SERVICE_DIR, "script.sh");
        let checksum_container_path = join_unix_path(CONTAINER_SERVICE_DIR, "checksum");

        let command = generate_checksum_command(
            &import.add,
            &import.include_paths,
            &import.exclude_paths,
            &checksum_container_path,
        );
        stapel::create_script(&script_host_path, &[command]).await?;

        let run_opts = RunOpts {
            remove: true,
            user: Some("0:0".to_string()),
            workdir: Some("/".to_string()),
            entrypoint: Some(stapel::bash_bin_path()),
            volumes: vec![format!(
                "{}:{}",
                host_dir.to_string_lossy(),
                CONTAINER_SERVICE_DIR
            )],
            volumes_from: vec![stapel_container],
        };

        if std::env::var(DEBUG_IMPORT_SOURCE_CHECKSUM_ENV).as_deref() == Ok("1") {
            info!(
                image = %source.image_name,
                script = %script_container_path,
                ?run_opts,
                "checksum container invocation"
            );
        }

        self.runtime
            .run(&source.image_name, &[script_container_path], run_opts)
            .await
            .map_err(|e| {
                WerfError::runtime(format!(
                    "import source checksum container for {} failed: {}",
                    source.image_name, e
                ))
            })?;

        let data = tokio::fs::read_to_string(&checksum_host_path)
            .await
            .map_err(|e| WerfError::io(&checksum_host_path, e))?;

        Ok(data.trim().to_string())
    }
}

/// The in-container pipeline listing the import's files, sorting them, and
/// collapsing their md5 sums into one checksum written to
/// `result_checksum_path`.
///
/// Stable across hosts: patterns and tool names are fixed and the file list
/// is sorted before hashing.
pub fn generate_checksum_command(
    from: &str,
    include_paths: &[String],
    exclude_paths: &[String],
    result_checksum_path: &str,
) -> String {
    let mut find_parts = vec!["find".to_string(), from.to_string(), "-type".into(), "f".into()];

    let include_args: Vec<String> = include_paths
        .iter()
        .map(|p| format_include_and_exclude_path(p))
        .flat_map(|p| {
            [
                format!("-wholename \"{}\"", join_unix_path(from, &p)),
                format!("-wholename \"{}\"", join_unix_path(from, &format!("{}/**", p))),
            ]
        })
        .collect();

    if !include_args.is_empty() {
        find_parts.push(format!("\\( {} \\)", include_args.join(" -or ")));
    }

    let exclude_args: Vec<String> = exclude_paths
        .iter()
        .map(|p| format_include_and_exclude_path(p))
        .flat_map(|p| {
            [
                format!("! -wholename \"{}\"", join_unix_path(from, &p)),
                format!("! -wholename \"{}\"", join_unix_path(from, &format!("{}/**", p))),
            ]
        })
        .collect();

    if !exclude_args.is_empty() {
        if !include_args.is_empty() {
            find_parts.push("-and".to_string());
        }
        find_parts.push(format!("\\( {} \\)", exclude_args.join(" -and ")));
    }

    let commands = [
        find_parts.join(" "),
        "sort -n".to_string(),
        "xargs md5sum".to_string(),
        "md5sum".to_string(),
        "cut -d ' ' -f 1".to_string(),
    ];

    format!("{} > {}", commands.join(" | "), result_checksum_path)
}

/// Include/exclude paths are globs; trailing `*` and `/` are folded into the
/// generated `-wholename` pair.
fn format_include_and_exclude_path(path: &str) -> String {
    path.trim_end_matches(['*', '/']).to_string()
}
