//! Integration tests for the stage pipeline.
//!
//! A fake git repo, a fake container runtime and the in-memory stages
//! storage drive whole-conveyor builds, covering digest determinism and
//! sensitivity, ancestry-restricted cache selection, virtual-merge
//! normalization, mount label inheritance and import checksum memoization.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use werf_core::config::{
    BuildSettings, GitMappingConfig, ImageConfig, ImportConfig, MountConfig, MountType,
    ProjectConfig,
};
use werf_core::conveyor::{BuildReport, Conveyor, ImageBuildReport, ResolvedStage};
use werf_core::error::{Result, WerfError};
use werf_core::git::{CommitInfo, GitMapping, GitRepo, PathScope};
use werf_core::image::{ImageInfo, StageDescription, StageId, MOUNT_TMP_DIR_LABEL};
use werf_core::runtime::{
    BuildFromDockerfileOpts, BuilderInfo, CommitOpts, ContainerRuntime, RmiOpts,
    RunCommandOpts, RunOpts,
};
use werf_core::stage::StageName;
use werf_core::storage::{MemoryStagesStorage, StagesStorage};

/// Fake repository with an explicit commit graph and patch table.
#[derive(Debug)]
struct FakeGitRepo {
    name: String,
    head: RwLock<CommitInfo>,
    parents: RwLock<HashMap<String, Vec<String>>>,
    patches: RwLock<HashMap<(String, String), String>>,
}

impl FakeGitRepo {
    fn new(name: &str, head_commit: &str) -> Arc<Self> {
        let repo = Arc::new(Self {
            name: name.to_string(),
            head: RwLock::new(CommitInfo::plain(head_commit)),
            parents: RwLock::new(HashMap::new()),
            patches: RwLock::new(HashMap::new()),
        });
        repo.add_commit(head_commit, &[]);
        repo
    }

    fn add_commit(&self, commit: &str, parents: &[&str]) {
        self.parents
            .write()
            .unwrap()
            .insert(commit.to_string(), parents.iter().map(|p| p.to_string()).collect());
    }

    fn set_head(&self, commit: &str) {
        *self.head.write().unwrap() = CommitInfo::plain(commit);
    }

    fn set_virtual_head(&self, merge_commit: &str, from_commit: &str) {
        *self.head.write().unwrap() = CommitInfo {
            commit: merge_commit.to_string(),
            virtual_merge: true,
            virtual_merge_from_commit: from_commit.to_string(),
        };
    }

    fn set_patch(&self, from: &str, to: &str, content: &str) {
        self.patches
            .write()
            .unwrap()
            .insert((from.to_string(), to.to_string()), content.to_string());
    }
}

#[async_trait]
impl GitRepo for FakeGitRepo {
    fn name(&self) -> &str {
        &self.name
    }

    async fn head_commit_info(&self) -> Result<CommitInfo> {
        Ok(self.head.read().unwrap().clone())
    }

    async fn is_ancestor(&self, older: &str, newer: &str) -> Result<bool> {
        if older == newer {
            return Ok(true);
        }

        let parents = self.parents.read().unwrap();
        let mut queue = vec![newer.to_string()];
        while let Some(commit) = queue.pop() {
            if commit == older {
                return Ok(true);
            }
            if let Some(commit_parents) = parents.get(&commit) {
                queue.extend(commit_parents.iter().cloned());
            }
        }

        Ok(false)
    }

    async fn is_commit_exists(&self, commit: &str) -> Result<bool> {
        Ok(self.parents.read().unwrap().contains_key(commit))
    }

    async fn diff(&self, from: &str, to: &str, _scope: &PathScope) -> Result<String> {
        Ok(self
            .patches
            .read()
            .unwrap()
            .get(&(from.to_string(), to.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn create_archive(
        &self,
        _commit: &str,
        _scope: &PathScope,
        out_path: &Path,
    ) -> Result<()> {
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WerfError::io(parent, e))?;
        }
        std::fs::write(out_path, b"").map_err(|e| WerfError::io(out_path, e))
    }
}

/// Fake runtime: commits fabricate image ids, checksum runs write a fixed
/// checksum file into the mounted host dir.
#[derive(Debug, Default)]
struct FakeRuntime {
    images: Mutex<HashMap<String, BuilderInfo>>,
    next_id: AtomicUsize,
    checksum_runs: AtomicUsize,
    /// Delay injected into `from_command`, for cancellation tests.
    from_delay_ms: u64,
}

impl FakeRuntime {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_delay(from_delay_ms: u64) -> Arc<Self> {
        Arc::new(Self { from_delay_ms, ..Default::default() })
    }

    fn seed_image(&self, reference: &str, id: &str) {
        self.images.lock().unwrap().insert(
            reference.to_string(),
            BuilderInfo { id: id.to_string(), labels: HashMap::new() },
        );
    }

    fn checksum_runs(&self) -> usize {
        self.checksum_runs.load(Ordering::SeqCst)
    }

    fn fresh_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn pull(&self, reference: &str) -> Result<()> {
        let id = self.fresh_id("pulled");
        self.images
            .lock()
            .unwrap()
            .entry(reference.to_string())
            .or_insert(BuilderInfo { id, labels: HashMap::new() });
        Ok(())
    }

    async fn push(&self, _reference: &str) -> Result<()> {
        Ok(())
    }

    async fn tag(&self, reference: &str, new_reference: &str) -> Result<()> {
        let info = self.images.lock().unwrap().get(reference).cloned();
        if let Some(info) = info {
            self.images.lock().unwrap().insert(new_reference.to_string(), info);
        }
        Ok(())
    }

    async fn build_from_dockerfile(
        &self,
        _dockerfile: &[u8],
        _opts: BuildFromDockerfileOpts,
    ) -> Result<String> {
        Ok(self.fresh_id("dockerfile-img"))
    }

    async fn run(&self, _image: &str, _command: &[String], opts: RunOpts) -> Result<()> {
        self.checksum_runs.fetch_add(1, Ordering::SeqCst);

        // the checksum script writes to the mounted service dir
        let volume = opts.volumes.first().expect("checksum run must mount the service dir");
        let host_dir = volume.split(':').next().unwrap();
        std::fs::write(Path::new(host_dir).join("checksum"), "fakesum\n")
            .map_err(|e| WerfError::io(host_dir, e))?;

        Ok(())
    }

    async fn run_command(
        &self,
        _container: &str,
        _command: &[String],
        _opts: RunCommandOpts,
    ) -> Result<()> {
        Ok(())
    }

    async fn from_command(&self, container: &str, _image: &str) -> Result<String> {
        if self.from_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.from_delay_ms)).await;
        }

        let id = self.fresh_id("ctr");
        self.images
            .lock()
            .unwrap()
            .insert(container.to_string(), BuilderInfo { id: id.clone(), labels: HashMap::new() });
        Ok(id)
    }

    async fn commit(&self, _container: &str, _opts: CommitOpts) -> Result<String> {
        let id = self.fresh_id("img");
        self.seed_image(&id, &id);
        Ok(id)
    }

    async fn rm(&self, container: &str) -> Result<()> {
        self.images.lock().unwrap().remove(container);
        Ok(())
    }

    async fn inspect(&self, reference: &str) -> Result<Option<BuilderInfo>> {
        Ok(self.images.lock().unwrap().get(reference).cloned())
    }

    async fn rmi(&self, reference: &str, _opts: RmiOpts) -> Result<()> {
        self.images.lock().unwrap().remove(reference);
        Ok(())
    }

    async fn mount(&self, _container: &str) -> Result<std::path::PathBuf> {
        Err(WerfError::runtime("not supported by fake runtime"))
    }

    async fn umount(&self, _container: &str) -> Result<()> {
        Err(WerfError::runtime("not supported by fake runtime"))
    }
}

fn project(images: Vec<ImageConfig>) -> ProjectConfig {
    ProjectConfig { project: "demo".into(), images }
}

fn simple_image(name: &str, from: &str, install: &[&str]) -> ImageConfig {
    ImageConfig {
        name: name.to_string(),
        from: Some(from.to_string()),
        shell: werf_core::config::ShellConfig {
            install: install.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn conveyor(
    project: ProjectConfig,
    storage: Arc<dyn StagesStorage>,
    runtime: Arc<FakeRuntime>,
    repos: HashMap<String, Arc<dyn GitRepo>>,
    head_commit: &str,
) -> Arc<Conveyor> {
    Arc::new(Conveyor::new(
        project,
        BuildSettings::default(),
        storage,
        runtime,
        repos,
        head_commit,
    ))
}

fn image_report<'a>(report: &'a BuildReport, name: &str) -> &'a ImageBuildReport {
    report
        .images
        .iter()
        .find(|image| image.name == name)
        .unwrap_or_else(|| panic!("no report for image {:?}", name))
}

fn stage<'a>(image: &'a ImageBuildReport, name: StageName) -> &'a ResolvedStage {
    image
        .stages
        .iter()
        .find(|stage| stage.name == name)
        .unwrap_or_else(|| panic!("no {} stage in report for {:?}", name, image.name))
}

fn try_stage<'a>(image: &'a ImageBuildReport, name: StageName) -> Option<&'a ResolvedStage> {
    image.stages.iter().find(|stage| stage.name == name)
}

fn mapping_labels(repo: Arc<dyn GitRepo>, info: &CommitInfo) -> HashMap<String, String> {
    let config = GitMappingConfig {
        name: "main".into(),
        add: "/".into(),
        to: "/app".into(),
        ..Default::default()
    };
    let mapping = GitMapping::from_config(&config, repo);

    let mut labels = std::collections::BTreeMap::new();
    mapping.write_commit_labels(info, &mut labels);
    labels.into_iter().collect()
}

fn git_image(name: &str, from: &str, install: &[&str]) -> ImageConfig {
    let mut image = simple_image(name, from, install);
    image.git = vec![GitMappingConfig {
        name: "main".into(),
        add: "/".into(),
        to: "/app".into(),
        ..Default::default()
    }];
    image
}

async fn build(conveyor: &Arc<Conveyor>) -> BuildReport {
    Arc::clone(conveyor).build().await.expect("build should succeed")
}

// --- scenario (a): two-stage chain, pure from ------------------------------

#[tokio::test]
async fn test_install_digest_tracks_shell_command_and_base() {
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    runtime.seed_image("alpine:3.15", "alpine-315-id");

    let build_digests = |from: &str, command: &str| {
        let runtime = Arc::clone(&runtime);
        let from = from.to_string();
        let command = command.to_string();
        async move {
            let conveyor = conveyor(
                project(vec![simple_image("app", &from, &[command.as_str()])]),
                Arc::new(MemoryStagesStorage::new()),
                runtime,
                HashMap::new(),
                "head",
            );
            let report = build(&conveyor).await;
            let image = image_report(&report, "app");
            (
                stage(image, StageName::From).digest.clone(),
                stage(image, StageName::Install).digest.clone(),
            )
        }
    };

    let (from_a, install_a) = build_digests("alpine:3.14", "apk add curl").await;
    let (from_b, install_b) = build_digests("alpine:3.14", "apk add curl").await;
    let (from_c, install_c) = build_digests("alpine:3.14", "apk add wget").await;
    let (from_d, install_d) = build_digests("alpine:3.15", "apk add curl").await;

    // identical inputs: identical digests
    assert_eq!(from_a, from_b);
    assert_eq!(install_a, install_b);

    // command change re-keys install only
    assert_eq!(from_a, from_c);
    assert_ne!(install_a, install_c);

    // base change re-keys from and everything after it
    assert_ne!(from_a, from_d);
    assert_ne!(install_a, install_d);
}

#[tokio::test]
async fn test_identical_rebuild_hits_cache() {
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    let storage: Arc<dyn StagesStorage> = Arc::new(MemoryStagesStorage::new());

    let images = vec![simple_image("app", "alpine:3.14", &["apk add curl"])];

    let first = conveyor(
        project(images.clone()),
        Arc::clone(&storage),
        Arc::clone(&runtime),
        HashMap::new(),
        "head",
    );
    let first_report = build(&first).await;

    let second = conveyor(project(images), storage, runtime, HashMap::new(), "head");
    let second_report = build(&second).await;

    let first_image = image_report(&first_report, "app");
    let second_image = image_report(&second_report, "app");

    assert!(first_image.stages.iter().all(|s| !s.cached));
    assert!(second_image.stages.iter().all(|s| s.cached));

    for (a, b) in first_image.stages.iter().zip(&second_image.stages) {
        assert_eq!(a.digest, b.digest);
        assert_eq!(a.content_digest, b.content_digest);
        assert_eq!(a.description.info.name, b.description.info.name);
    }
}

// --- scenario (b): mount label round-trip ----------------------------------

#[tokio::test]
async fn test_mount_labels_roundtrip_and_inherit() {
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    let storage: Arc<dyn StagesStorage> = Arc::new(MemoryStagesStorage::new());

    let mut with_mounts = simple_image("app", "alpine:3.14", &["true"]);
    with_mounts.mounts = vec![
        MountConfig { mount_type: MountType::TmpDir, from: String::new(), to: "/tmp/foo".into() },
        MountConfig { mount_type: MountType::TmpDir, from: String::new(), to: "/tmp/bar".into() },
    ];

    let first = conveyor(
        project(vec![with_mounts]),
        Arc::clone(&storage),
        Arc::clone(&runtime),
        HashMap::new(),
        "head",
    );
    let first_report = build(&first).await;
    let install = stage(image_report(&first_report, "app"), StageName::Install);

    assert_eq!(
        install.description.info.labels.get(MOUNT_TMP_DIR_LABEL).map(String::as_str),
        Some("/tmp/bar;/tmp/foo"),
    );

    // rebuild on top without config mounts: mounts come back from labels
    let mut without_mounts = simple_image("app", "alpine:3.14", &["true"]);
    without_mounts.shell.setup = vec!["echo done".into()];

    let second = conveyor(project(vec![without_mounts]), storage, runtime, HashMap::new(), "head");
    let second_report = build(&second).await;
    let setup = stage(image_report(&second_report, "app"), StageName::Setup);

    assert_eq!(
        setup.description.info.labels.get(MOUNT_TMP_DIR_LABEL).map(String::as_str),
        Some("/tmp/bar;/tmp/foo"),
    );
}

// --- scenario (c): import checksum memoization -----------------------------

#[tokio::test]
async fn test_identical_imports_run_one_checksum_container() {
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    let storage: Arc<dyn StagesStorage> = Arc::new(MemoryStagesStorage::new());

    let import = ImportConfig {
        image_name: "builder".into(),
        add: "/src".into(),
        to: "/app".into(),
        before: "install".into(),
        include_paths: vec!["*.go".into()],
        ..Default::default()
    };

    let builder = simple_image("builder", "alpine:3.14", &["make"]);
    let mut app1 = simple_image("app1", "alpine:3.14", &["true"]);
    app1.imports = vec![import.clone()];
    let mut app2 = simple_image("app2", "alpine:3.14", &["true"]);
    app2.imports = vec![import];

    let conveyor = conveyor(
        project(vec![builder, app1, app2]),
        storage,
        Arc::clone(&runtime),
        HashMap::new(),
        "head",
    );
    let report = build(&conveyor).await;

    // both consumers imported the same source tree: one container run
    assert_eq!(runtime.checksum_runs(), 1);

    let imports1 =
        stage(image_report(&report, "app1"), StageName::ImportsBeforeInstall);
    let imports2 =
        stage(image_report(&report, "app2"), StageName::ImportsBeforeInstall);
    assert_eq!(imports1.digest, imports2.digest);
}

// --- scenario (d): ancestry filter -----------------------------------------

#[tokio::test]
async fn test_git_archive_selects_only_ancestors() {
    let repo = FakeGitRepo::new("main", "C1");
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    let storage = Arc::new(MemoryStagesStorage::new());

    let repos: HashMap<String, Arc<dyn GitRepo>> =
        [("main".to_string(), repo.clone() as Arc<dyn GitRepo>)].into();

    let images = vec![git_image("app", "alpine:3.14", &["true"])];

    let first = conveyor(
        project(images.clone()),
        storage.clone() as Arc<dyn StagesStorage>,
        Arc::clone(&runtime),
        repos.clone(),
        "C1",
    );
    let first_report = build(&first).await;
    let archive = stage(image_report(&first_report, "app"), StageName::GitArchive);
    let archive_digest = archive.digest.clone();

    // seed non-ancestor candidates that would win on age alone
    for (unique_id, commit) in [(1, "C2"), (2, "C3")] {
        let description = StageDescription {
            stage_id: StageId { digest: archive_digest.clone(), unique_id },
            info: ImageInfo {
                name: format!("werf-stages:{}-{}", archive_digest, unique_id),
                id: format!("decoy-{}", commit),
                labels: mapping_labels(
                    repo.clone() as Arc<dyn GitRepo>,
                    &CommitInfo::plain(commit),
                ),
                ..Default::default()
            },
        };
        storage.put_stage("demo", &description).await.unwrap();
    }

    // advance history: H's only ancestor among recorded commits is C1
    repo.add_commit("H", &["C1"]);
    repo.set_head("H");

    let second = conveyor(
        project(images),
        storage as Arc<dyn StagesStorage>,
        runtime,
        repos,
        "H",
    );
    let second_report = build(&second).await;
    let selected = stage(image_report(&second_report, "app"), StageName::GitArchive);

    assert!(selected.cached);
    assert_eq!(selected.digest, archive_digest);
    assert_eq!(selected.description.info.id, archive.description.info.id);
}

// --- scenario (e): virtual-merge normalization -----------------------------

#[tokio::test]
async fn test_ancestry_uses_virtual_merge_origin() {
    let repo = FakeGitRepo::new("main", "C1");
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    let storage = Arc::new(MemoryStagesStorage::new());

    let repos: HashMap<String, Arc<dyn GitRepo>> =
        [("main".to_string(), repo.clone() as Arc<dyn GitRepo>)].into();

    let images = vec![git_image("app", "alpine:3.14", &["true"])];

    let first = conveyor(
        project(images.clone()),
        storage.clone() as Arc<dyn StagesStorage>,
        Arc::clone(&runtime),
        repos.clone(),
        "C1",
    );
    let first_report = build(&first).await;
    let archive_digest =
        stage(image_report(&first_report, "app"), StageName::GitArchive).digest.clone();

    // candidate recorded from a virtual merge M whose declared origin is C1;
    // M itself is not in the history at all
    let candidate = StageDescription {
        stage_id: StageId { digest: archive_digest.clone(), unique_id: 1 },
        info: ImageInfo {
            name: format!("werf-stages:{}-1", archive_digest),
            id: "virtual-merge-build".into(),
            labels: mapping_labels(
                repo.clone() as Arc<dyn GitRepo>,
                &CommitInfo {
                    commit: "M".into(),
                    virtual_merge: true,
                    virtual_merge_from_commit: "C1".into(),
                },
            ),
            ..Default::default()
        },
    };
    storage.put_stage("demo", &candidate).await.unwrap();

    repo.add_commit("H", &["C1"]);
    repo.set_head("H");

    let second = conveyor(
        project(images),
        storage as Arc<dyn StagesStorage>,
        runtime,
        repos,
        "H",
    );
    let second_report = build(&second).await;
    let selected = stage(image_report(&second_report, "app"), StageName::GitArchive);

    // ancestry was checked against C1, not M, and the candidate is oldest
    assert!(selected.cached);
    assert_eq!(selected.description.info.id, "virtual-merge-build");
}

// --- empty patch => empty stage --------------------------------------------

#[tokio::test]
async fn test_patch_stages_skip_when_patch_is_empty() {
    let repo = FakeGitRepo::new("main", "C1");
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");
    let storage: Arc<dyn StagesStorage> = Arc::new(MemoryStagesStorage::new());

    let repos: HashMap<String, Arc<dyn GitRepo>> =
        [("main".to_string(), repo.clone() as Arc<dyn GitRepo>)].into();

    let images = vec![git_image("app", "alpine:3.14", &["true"])];

    let first = conveyor(
        project(images.clone()),
        Arc::clone(&storage),
        Arc::clone(&runtime),
        repos.clone(),
        "C1",
    );
    let first_report = build(&first).await;
    let first_image = image_report(&first_report, "app");

    // nothing changed since the archive: no patch stages
    assert!(try_stage(first_image, StageName::GitCache).is_none());
    assert!(try_stage(first_image, StageName::GitLatestPatch).is_none());

    // new commit with a real patch
    repo.add_commit("C2", &["C1"]);
    repo.set_head("C2");
    repo.set_patch("C1", "C2", "diff --git a/f b/f\n+change\n");

    let second = conveyor(project(images), storage, runtime, repos, "C2");
    let second_report = build(&second).await;
    let second_image = image_report(&second_report, "app");

    // the archive from C1 is still suitable (C1 is an ancestor of C2)
    assert!(stage(second_image, StageName::GitArchive).cached);

    // the accumulated patch now applies
    let cache_stage = stage(second_image, StageName::GitCache);
    assert!(!cache_stage.cached);

    let labels = &cache_stage.description.info.labels;
    assert!(
        labels.values().any(|v| v == "C2"),
        "patch stage must record the new commit, labels: {:?}",
        labels
    );
}

// --- digest chain propagation ----------------------------------------------

#[tokio::test]
async fn test_downstream_stages_rekey_when_an_input_changes() {
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");

    let build_app = |install: &str, cmd: &str| {
        let runtime = Arc::clone(&runtime);
        let install = install.to_string();
        let cmd = cmd.to_string();
        async move {
            let mut image = simple_image("app", "alpine:3.14", &[install.as_str()]);
            image.docker.cmd = vec![cmd];

            let conveyor = conveyor(
                project(vec![image]),
                Arc::new(MemoryStagesStorage::new()),
                runtime,
                HashMap::new(),
                "head",
            );
            let report = build(&conveyor).await;
            let image = image_report(&report, "app");
            (
                stage(image, StageName::Install).digest.clone(),
                stage(image, StageName::DockerInstructions).digest.clone(),
            )
        }
    };

    let (install_a, docker_a) = build_app("make", "run-a").await;
    let (install_b, docker_b) = build_app("make", "run-b").await;
    let (install_c, docker_c) = build_app("make tools", "run-a").await;

    // late-stage change leaves earlier stages alone
    assert_eq!(install_a, install_b);
    assert_ne!(docker_a, docker_b);

    // early-stage change propagates to every following digest
    assert_ne!(install_a, install_c);
    assert_ne!(docker_a, docker_c);
}

// --- conveyor queries -------------------------------------------------------

#[tokio::test]
async fn test_conveyor_exposes_content_digests() {
    let runtime = FakeRuntime::new();
    runtime.seed_image("alpine:3.14", "alpine-314-id");

    let conveyor = conveyor(
        project(vec![simple_image("app", "alpine:3.14", &["true"])]),
        Arc::new(MemoryStagesStorage::new()),
        runtime,
        HashMap::new(),
        "head",
    );
    let report = build(&conveyor).await;
    let image = image_report(&report, "app");

    assert_eq!(
        conveyor.get_image_content_digest("app").as_deref(),
        Some(image.stages.last().unwrap().content_digest.as_str()),
    );
    assert_eq!(
        conveyor.get_image_stage_content_digest("app", StageName::Install).as_deref(),
        Some(stage(image, StageName::Install).content_digest.as_str()),
    );
    assert!(conveyor.get_image_name_for_last_image_stage("app").is_some());
    assert!(conveyor.get_image_content_digest("ghost").is_none());
}

// --- cancellation ------------------------------------------------------------

#[tokio::test]
async fn test_shutdown_cancels_in_flight_build() {
    let runtime = FakeRuntime::with_delay(5_000);
    runtime.seed_image("alpine:3.14", "alpine-314-id");

    let conveyor = conveyor(
        project(vec![simple_image("app", "alpine:3.14", &["true"])]),
        Arc::new(MemoryStagesStorage::new()),
        runtime,
        HashMap::new(),
        "head",
    );

    let (tx, rx) = tokio::sync::broadcast::channel(1);
    let build = {
        let conveyor = Arc::clone(&conveyor);
        tokio::spawn(async move { conveyor.build_with_shutdown(rx).await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    tx.send(()).unwrap();

    let result = build.await.unwrap();
    assert!(matches!(result, Err(WerfError::Cancelled)));
}
