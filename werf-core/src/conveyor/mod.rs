//! The conveyor: plans and drives the whole build.
//!
//! Images are ordered topologically over their import edges, then built —
//! independent images concurrently, bounded by a worker pool. Within one
//! image, stages run strictly sequentially: each stage's digest feeds the
//! next stage's digest.
//!
//! All collaborators (stages storage, container runtime, git repos) are
//! injected; the conveyor holds no process-wide state.

use crate::config::{BuildSettings, ImageConfig, ProjectConfig};
use crate::digest::sha256_hash;
use crate::error::{Result, WerfError};
use crate::git::{GitMapping, GitRepo};
use crate::image::{ImageInfo, StageDescription, StageId, StageImage};
use crate::import::{ImportChecksumLocks, ImportCoordinator, ImportServer, StapelImportServer};
use crate::runtime::{BuildFromDockerfileOpts, CommitOpts, ContainerRuntime, RunCommandOpts};
use crate::stage::{plan_stages, ImageLookup, Stage, StageName, StageServices};
use crate::storage::StagesStorage;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

/// A stage resolved by the conveyor: its computed identities plus the
/// description it was looked up or built as.
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub name: StageName,
    pub digest: String,
    pub content_digest: String,
    pub cached: bool,
    pub description: StageDescription,
}

/// Per-image build outcome.
#[derive(Debug, Clone)]
pub struct ImageBuildReport {
    pub name: String,
    pub stages: Vec<ResolvedStage>,
}

impl ImageBuildReport {
    pub fn cached_stages(&self) -> usize {
        self.stages.iter().filter(|s| s.cached).count()
    }
}

/// Whole-plan build outcome.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub images: Vec<ImageBuildReport>,
    pub duration_secs: f64,
}

#[derive(Default)]
struct PlanState {
    /// Resolutions per image name, in executed-stage order.
    images: HashMap<String, Vec<ResolvedStage>>,
}

impl PlanState {
    fn last_stage(&self, image_name: &str) -> Option<&ResolvedStage> {
        self.images.get(image_name).and_then(|stages| stages.last())
    }

    fn stage(&self, image_name: &str, name: StageName) -> Option<&ResolvedStage> {
        self.images.get(image_name).and_then(|stages| {
            stages.iter().find(|resolved| resolved.name == name)
        })
    }
}

/// The conveyor's answers to cross-image stage queries.
struct ConveyorLookup {
    state: Arc<RwLock<PlanState>>,
    import_servers: Arc<RwLock<HashMap<String, Arc<dyn ImportServer>>>>,
}

impl ImageLookup for ConveyorLookup {
    fn image_content_digest(&self, image_name: &str) -> Option<String> {
        let state = self.state.read().expect("plan state lock poisoned");
        state.last_stage(image_name).map(|s| s.content_digest.clone())
    }

    fn image_stage_content_digest(
        &self,
        image_name: &str,
        stage: StageName,
    ) -> Option<String> {
        let state = self.state.read().expect("plan state lock poisoned");
        state.stage(image_name, stage).map(|s| s.content_digest.clone())
    }

    fn image_name_for_last_image_stage(&self, image_name: &str) -> Option<String> {
        let state = self.state.read().expect("plan state lock poisoned");
        state.last_stage(image_name).map(|s| s.description.info.name.clone())
    }

    fn image_name_for_image_stage(
        &self,
        image_name: &str,
        stage: StageName,
    ) -> Option<String> {
        let state = self.state.read().expect("plan state lock poisoned");
        state.stage(image_name, stage).map(|s| s.description.info.name.clone())
    }

    fn image_id_for_last_image_stage(&self, image_name: &str) -> Option<String> {
        let state = self.state.read().expect("plan state lock poisoned");
        state.last_stage(image_name).map(|s| s.description.info.id.clone())
    }

    fn image_id_for_image_stage(&self, image_name: &str, stage: StageName) -> Option<String> {
        let state = self.state.read().expect("plan state lock poisoned");
        state.stage(image_name, stage).map(|s| s.description.info.id.clone())
    }

    fn import_server(&self, source_image_name: &str) -> Arc<dyn ImportServer> {
        let servers = self.import_servers.read().expect("import servers lock poisoned");
        servers
            .get(source_image_name)
            .cloned()
            .unwrap_or_else(|| Arc::new(StapelImportServer))
    }
}

/// Top-level build orchestrator.
pub struct Conveyor {
    project: ProjectConfig,
    settings: BuildSettings,
    storage: Arc<dyn StagesStorage>,
    runtime: Arc<dyn ContainerRuntime>,
    repos: HashMap<String, Arc<dyn GitRepo>>,
    head_commit: String,
    state: Arc<RwLock<PlanState>>,
    import_servers: Arc<RwLock<HashMap<String, Arc<dyn ImportServer>>>>,
    import_locks: Arc<ImportChecksumLocks>,
}

impl Conveyor {
    pub fn new(
        project: ProjectConfig,
        settings: BuildSettings,
        storage: Arc<dyn StagesStorage>,
        runtime: Arc<dyn ContainerRuntime>,
        repos: HashMap<String, Arc<dyn GitRepo>>,
        head_commit: impl Into<String>,
    ) -> Self {
        Self {
            project,
            settings,
            storage,
            runtime,
            repos,
            head_commit: head_commit.into(),
            state: Arc::new(RwLock::new(PlanState::default())),
            import_servers: Arc::new(RwLock::new(HashMap::new())),
            import_locks: Arc::new(ImportChecksumLocks::default()),
        }
    }

    /// Override the import server used for copies out of a source image.
    pub fn register_import_server(
        &self,
        source_image_name: impl Into<String>,
        server: Arc<dyn ImportServer>,
    ) {
        self.import_servers
            .write()
            .expect("import servers lock poisoned")
            .insert(source_image_name.into(), server);
    }

    /// Build the whole project.
    pub async fn build(self: Arc<Self>) -> Result<BuildReport> {
        let (_tx, rx) = broadcast::channel(1);
        self.build_with_shutdown(rx).await
    }

    /// Build the whole project, aborting in-flight image builds when
    /// `shutdown` fires. Already-recorded stages stay valid: they are
    /// content-addressed and written atomically.
    #[instrument(skip_all, fields(project = %self.project.project))]
    pub async fn build_with_shutdown(
        self: Arc<Self>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<BuildReport> {
        let start = std::time::Instant::now();

        let levels = self.topological_levels()?;
        info!(
            images = self.project.images.len(),
            levels = levels.len(),
            "starting build"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_builds.max(1)));
        let mut reports: HashMap<String, ImageBuildReport> = HashMap::new();

        for level in levels {
            let mut tasks = JoinSet::new();

            for image in level {
                let conveyor = Arc::clone(&self);
                let semaphore = Arc::clone(&semaphore);
                let mut shutdown = shutdown.resubscribe();

                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("build semaphore closed");

                    tokio::select! {
                        report = conveyor.build_image(image) => report,
                        _ = wait_shutdown(&mut shutdown) => Err(WerfError::Cancelled),
                    }
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let report = joined
                    .map_err(|e| WerfError::Other(anyhow::anyhow!("build task panicked: {e}")))??;
                reports.insert(report.name.clone(), report);
            }
        }

        let images = self
            .project
            .images
            .iter()
            .filter_map(|image| reports.remove(&image.name))
            .collect();

        let duration_secs = start.elapsed().as_secs_f64();
        info!(duration_secs, "build finished");

        Ok(BuildReport { images, duration_secs })
    }

    /// Content digest of an image's last built stage.
    pub fn get_image_content_digest(&self, image_name: &str) -> Option<String> {
        self.lookup().image_content_digest(image_name)
    }

    /// Content digest of one named stage of an image.
    pub fn get_image_stage_content_digest(
        &self,
        image_name: &str,
        stage: StageName,
    ) -> Option<String> {
        self.lookup().image_stage_content_digest(image_name, stage)
    }

    /// Stage image name of an image's last built stage.
    pub fn get_image_name_for_last_image_stage(&self, image_name: &str) -> Option<String> {
        self.lookup().image_name_for_last_image_stage(image_name)
    }

    /// Runtime image id of one named stage of an image.
    pub fn get_image_id_for_image_stage(
        &self,
        image_name: &str,
        stage: StageName,
    ) -> Option<String> {
        self.lookup().image_id_for_image_stage(image_name, stage)
    }

    fn lookup(&self) -> ConveyorLookup {
        ConveyorLookup {
            state: Arc::clone(&self.state),
            import_servers: Arc::clone(&self.import_servers),
        }
    }

    /// Order images so every import source is fully resolved before its
    /// consumers, grouped into levels of mutually independent images.
    fn topological_levels(&self) -> Result<Vec<Vec<ImageConfig>>> {
        let by_name: HashMap<&str, &ImageConfig> =
            self.project.images.iter().map(|image| (image.name.as_str(), image)).collect();

        let mut in_degree: HashMap<&str, usize> =
            self.project.images.iter().map(|image| (image.name.as_str(), 0)).collect();
        let mut consumers: HashMap<&str, Vec<&str>> = HashMap::new();

        for image in &self.project.images {
            for import in &image.imports {
                let source = import.source_name();
                if !by_name.contains_key(source) {
                    return Err(WerfError::UnknownImage { image: source.to_string() });
                }
                *in_degree.get_mut(image.name.as_str()).expect("image registered") += 1;
                consumers.entry(source).or_default().push(image.name.as_str());
            }
        }

        let mut ready: VecDeque<&str> = {
            let mut names: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(name, _)| *name)
                .collect();
            names.sort();
            names.into()
        };

        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !ready.is_empty() {
            let level_names: Vec<&str> = ready.drain(..).collect();
            let mut next: Vec<&str> = Vec::new();

            for name in &level_names {
                placed += 1;
                if let Some(deps) = consumers.get(name) {
                    for consumer in deps {
                        let degree =
                            in_degree.get_mut(consumer).expect("consumer registered");
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(consumer);
                        }
                    }
                }
            }

            next.sort();
            next.dedup();
            ready.extend(next);

            levels.push(
                level_names.iter().map(|name| (*by_name.get(name).expect("image registered")).clone()).collect(),
            );
        }

        if placed != self.project.images.len() {
            let stuck = in_degree
                .iter()
                .find(|(_, degree)| **degree > 0)
                .map(|(name, _)| name.to_string())
                .unwrap_or_default();
            return Err(WerfError::CircularImportDependency { image: stuck });
        }

        Ok(levels)
    }

    /// Build one image: walk its stage plan, reusing suitable prior builds
    /// and committing the rest.
    #[instrument(skip_all, fields(image = %display_image_name(&image.name)))]
    async fn build_image(self: Arc<Self>, image: ImageConfig) -> Result<ImageBuildReport> {
        // scoped per-image tmp dir, released on every exit path
        let tmp_dir = tempfile::Builder::new()
            .prefix("werf-build-")
            .tempdir()
            .map_err(|e| WerfError::io(std::env::temp_dir(), e))?;

        let mut git_mappings = Vec::with_capacity(image.git.len());
        for mapping_config in &image.git {
            let repo = self.repos.get(&mapping_config.name).cloned().ok_or_else(|| {
                WerfError::UserConfig {
                    reason: format!("unknown git repo {:?}", mapping_config.name),
                }
            })?;
            git_mappings.push(Arc::new(GitMapping::from_config(mapping_config, repo)));
        }

        let coordinator = ImportCoordinator::new(
            self.project.project.clone(),
            tmp_dir.path(),
            Arc::clone(&self.storage),
            Arc::clone(&self.runtime),
            Arc::clone(&self.import_locks),
        );
        let lookup = self.lookup();
        let services = StageServices {
            head_commit: &self.head_commit,
            runtime: self.runtime.as_ref(),
            imports: &coordinator,
            lookup: &lookup,
        };

        let stages =
            plan_stages(&self.project.project, &image, tmp_dir.path(), git_mappings);

        struct PrevStage {
            digest: String,
            content_digest: String,
            next_deps: String,
        }

        let mut prev: Option<PrevStage> = None;
        let mut prev_built: Option<StageDescription> = None;
        let mut report = ImageBuildReport { name: image.name.clone(), stages: Vec::new() };

        for stage in &stages {
            if stage.is_empty(&services, prev_built.as_ref()).await? {
                debug!(stage = %stage.log_detailed_name(), "stage is empty, skipping");
                continue;
            }

            let deps = stage
                .get_dependencies(&services, prev_built.as_ref())
                .await
                .map_err(|e| stage_error(stage, "unable to compute dependencies", e))?;

            let mut digest_args = vec![stage.name().as_str().to_string()];
            if let Some(prev) = &prev {
                digest_args.push(prev.digest.clone());
            }
            digest_args.push(deps.clone());
            if let Some(prev) = &prev {
                digest_args.push(prev.next_deps.clone());
            }
            let digest = sha256_hash(&digest_args);

            let mut content_args = vec![stage.name().as_str().to_string(), deps];
            if let Some(prev) = &prev {
                content_args.push(prev.next_deps.clone());
                content_args.push(prev.content_digest.clone());
            }
            let content_digest = sha256_hash(&content_args);

            let candidates = self
                .storage
                .get_stages_by_digest(&self.project.project, &digest)
                .await
                .map_err(|e| stage_error(stage, "stage lookup failed", e))?;

            let selected = stage
                .select_suitable_stage(candidates)
                .await
                .map_err(|e| stage_error(stage, "unable to select suitable stage", e))?;

            let (description, cached) = match selected {
                Some(description) => {
                    info!(
                        stage = %stage.log_detailed_name(),
                        image = %description.info.name,
                        "using cached stage"
                    );
                    (description, true)
                }
                None => {
                    let mut spec = StageImage::default();
                    if let Some(prev_built) = &prev_built {
                        spec.from_image = Some(prev_built.info.name.clone());
                    }

                    stage
                        .prepare_image(&services, prev_built.as_ref(), &mut spec)
                        .await
                        .map_err(|e| stage_error(stage, "unable to prepare image", e))?;

                    // a committed image inherits its base image's labels;
                    // the stage's own labels win on conflict
                    if let Some(prev_built) = &prev_built {
                        for (key, value) in &prev_built.info.labels {
                            spec.labels
                                .entry(key.clone())
                                .or_insert_with(|| value.clone());
                        }
                    }

                    let description = self
                        .execute_stage(stage, &spec, &digest)
                        .await
                        .map_err(|e| stage_error(stage, "unable to build stage", e))?;

                    // recorded once; digest + unique id make the write unique
                    self.storage
                        .put_stage(&self.project.project, &description)
                        .await
                        .map_err(|e| stage_error(stage, "unable to record stage", e))?;

                    info!(
                        stage = %stage.log_detailed_name(),
                        image = %description.info.name,
                        "stage built"
                    );
                    (description, false)
                }
            };

            let next_deps = stage
                .get_next_stage_dependencies(Some(&description))
                .await
                .map_err(|e| stage_error(stage, "unable to compute next stage dependencies", e))?;

            let resolved = ResolvedStage {
                name: stage.name(),
                digest: digest.clone(),
                content_digest: content_digest.clone(),
                cached,
                description: description.clone(),
            };

            {
                let mut state = self.state.write().expect("plan state lock poisoned");
                state.images.entry(image.name.clone()).or_default().push(resolved.clone());
            }
            report.stages.push(resolved);

            prev = Some(PrevStage { digest, content_digest, next_deps });
            prev_built = Some(description);
        }

        info!(
            stages = report.stages.len(),
            cached = report.cached_stages(),
            "image stages resolved"
        );

        Ok(report)
    }

    /// Run the prepared spec through the runtime and describe the result.
    async fn execute_stage(
        &self,
        stage: &Stage,
        spec: &StageImage,
        digest: &str,
    ) -> Result<StageDescription> {
        let image_id = if let Some(dockerfile) = &spec.dockerfile {
            self.runtime
                .build_from_dockerfile(
                    &dockerfile.content,
                    BuildFromDockerfileOpts {
                        context_tar: None,
                        build_args: dockerfile.build_args.clone(),
                        target: dockerfile.target.clone(),
                    },
                )
                .await?
        } else {
            let from_image = spec.from_image.clone().ok_or_else(|| {
                WerfError::StageFailed {
                    image: stage.image_name().to_string(),
                    stage: stage.name().to_string(),
                    reason: "no base image for stage".to_string(),
                }
            })?;

            let container = format!("werf-stage-{}", uuid::Uuid::new_v4());
            self.runtime.from_command(&container, &from_image).await?;

            let commands = spec.all_run_commands();
            if !commands.is_empty() {
                self.runtime
                    .run_command(
                        &container,
                        &commands,
                        RunCommandOpts { volumes: spec.volumes.clone(), ..Default::default() },
                    )
                    .await?;
            }

            let image_id = self
                .runtime
                .commit(
                    &container,
                    CommitOpts {
                        labels: spec.labels.clone(),
                        instructions: spec.instructions.clone(),
                    },
                )
                .await?;

            if let Err(e) = self.runtime.rm(&container).await {
                warn!(container = %container, "failed to remove stage container: {}", e);
            }

            image_id
        };

        let stage_id = StageId::new(digest);
        let stage_image_name =
            format!("{}:{}-{}", self.settings.stages_repo, digest, stage_id.unique_id);
        self.runtime.tag(&image_id, &stage_image_name).await?;

        Ok(StageDescription {
            stage_id,
            info: ImageInfo {
                name: stage_image_name,
                id: image_id,
                labels: spec.labels.clone().into_iter().collect(),
                created: Utc::now().to_rfc3339(),
            },
        })
    }
}

fn display_image_name(name: &str) -> &str {
    if name.is_empty() {
        "~"
    } else {
        name
    }
}

fn stage_error(stage: &Stage, context: &str, source: WerfError) -> WerfError {
    match source {
        // cancellation and integrity panics keep their shape
        WerfError::Cancelled => WerfError::Cancelled,
        source => WerfError::StageFailed {
            image: stage.image_name().to_string(),
            stage: stage.name().to_string(),
            reason: format!("{}: {}", context, source),
        },
    }
}

/// Resolves when the shutdown signal fires; pends forever when the channel
/// is gone (nobody can signal anymore).
async fn wait_shutdown(rx: &mut broadcast::Receiver<()>) {
    loop {
        match rx.recv().await {
            Ok(()) => return,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
