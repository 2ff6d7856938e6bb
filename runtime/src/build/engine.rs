//! Image build engine.
//!
//! Executes a parsed Dockerfile stage by stage. Each layer-producing
//! instruction (`RUN`, `COPY`, `WORKDIR`) is applied to the stage's
//! snapshot and the resulting diff is stored as a layer; metadata
//! instructions only update the image config. Results are cached by a
//! chained key, and the first miss in a stage forces every later
//! instruction of that stage to execute.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dockling_core::error::{DocklingError, Result};
use dockling_core::event::{events, EngineEvent, EventEmitter};
use tokio_util::sync::CancellationToken;

use super::cache::{base_key, chain_key, BuildCache, CacheRecord};
use super::context::{copy_into, resolve_in, resolve_sources, sources_digest, BuildContext};
use super::dockerfile::{Dockerfile, Instruction};
use super::runner::{CommandRunner, RunRequest};
use crate::digest::{ImageId, LayerId};
use crate::fs::blocking;
use crate::image::{HistoryEntry, Image, ImageConfig, ImageReference, ImageStore};
use crate::layer::Snapshot;

/// Supplies base images that are not present locally (e.g. a registry pull).
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    async fn fetch(&self, reference: &ImageReference) -> Result<Image>;
}

/// Options for a single build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Tag applied to the final image
    pub tag: Option<ImageReference>,
    /// `--build-arg` values
    pub build_args: BTreeMap<String, String>,
    /// Ignore the cache and execute every instruction
    pub no_cache: bool,
}

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub image_id: ImageId,
    pub reference: Option<ImageReference>,
    /// Full layer stack of the image, bottom to top
    pub layers: Vec<LayerId>,
    /// Layer-producing instructions that were executed
    pub executed: usize,
    /// Layer-producing instructions served from the cache
    pub cached: usize,
}

/// Builds images from Dockerfiles.
pub struct Builder {
    images: Arc<ImageStore>,
    cache: Arc<BuildCache>,
    runner: Arc<dyn CommandRunner>,
    base_source: Option<Arc<dyn BaseImageSource>>,
    events: EventEmitter,
}

/// Mutable state of one stage.
#[derive(Clone)]
struct Stage {
    name: Option<String>,
    snapshot: Snapshot,
    layers: Vec<LayerId>,
    config: ImageConfig,
    history: Vec<HistoryEntry>,
    cache_key: String,
    args: BTreeMap<String, String>,
    /// CMD came from the base image and is reset by ENTRYPOINT
    cmd_inherited: bool,
    cache_broken: bool,
}

impl Stage {
    fn new(name: Option<String>, key: String, args: BTreeMap<String, String>) -> Self {
        Self {
            name,
            snapshot: Snapshot::new(),
            layers: Vec::new(),
            config: ImageConfig::default(),
            history: Vec::new(),
            cache_key: key,
            args,
            cmd_inherited: false,
            cache_broken: false,
        }
    }

    /// Variables visible to substitution: build args, overridden by ENV.
    fn vars(&self) -> BTreeMap<String, String> {
        let mut vars = self.args.clone();
        vars.extend(self.config.env_map());
        vars
    }

    fn workdir(&self) -> String {
        self.config
            .working_dir
            .clone()
            .unwrap_or_else(|| "/".to_string())
    }

    fn record_history(&mut self, created_by: &str, empty_layer: bool) {
        self.history.push(HistoryEntry {
            created_by: created_by.to_string(),
            empty_layer,
            created: Utc::now(),
        });
    }
}

enum StepOutcome {
    Executed,
    Cached,
    Metadata,
}

impl Builder {
    pub fn new(
        images: Arc<ImageStore>,
        cache: Arc<BuildCache>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            images,
            cache,
            runner,
            base_source: None,
            events: EventEmitter::default(),
        }
    }

    /// Fetch missing base images from `source`.
    pub fn with_base_source(mut self, source: Arc<dyn BaseImageSource>) -> Self {
        self.base_source = Some(source);
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn cache(&self) -> &Arc<BuildCache> {
        &self.cache
    }

    /// Build `dockerfile` against `context`.
    ///
    /// On failure no image or tag is registered; layers produced so far stay
    /// unreferenced until the next layer GC. Cancellation is observed
    /// between instructions; a running `RUN` completes first.
    pub async fn build(
        &self,
        dockerfile: &Dockerfile,
        context: &BuildContext,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let total = dockerfile.steps.len();
        let _lease = self.images.layers().lease()?;
        let mut global_args: BTreeMap<String, String> = BTreeMap::new();
        let mut stages: Vec<Stage> = Vec::new();
        let mut current: Option<Stage> = None;
        let mut executed = 0;
        let mut cached = 0;

        for (index, step) in dockerfile.steps.iter().enumerate() {
            let number = index + 1;
            if cancel.is_cancelled() {
                tracing::warn!(step = number, "Build cancelled");
                return Err(DocklingError::Cancelled(number));
            }

            let vars = match &current {
                Some(stage) => stage.vars(),
                None => global_args.clone(),
            };
            let instruction = step.instruction.expand(&vars);
            let canonical = instruction.to_string();
            tracing::info!(step = number, total, instruction = %canonical, "Build step");

            let result = if let Instruction::From { image, alias } = &instruction {
                if let Some(done) = current.take() {
                    stages.push(done);
                }
                self.start_stage(image, alias.clone(), &stages, &global_args)
                    .await
                    .map(|stage| {
                        current = Some(stage);
                        StepOutcome::Metadata
                    })
            } else if let Some(stage) = current.as_mut() {
                self.apply_step(
                    stage,
                    &instruction,
                    &canonical,
                    context,
                    &stages,
                    &global_args,
                    options,
                )
                .await
            } else if let Instruction::Arg { name, default } = &instruction {
                if let Some(value) = options.build_args.get(name).or(default.as_ref()) {
                    global_args.insert(name.clone(), value.clone());
                }
                Ok(StepOutcome::Metadata)
            } else {
                Err(DocklingError::RecipeError(
                    "instruction before the first FROM".to_string(),
                ))
            };

            match result {
                Ok(StepOutcome::Executed) => executed += 1,
                Ok(StepOutcome::Cached) => {
                    tracing::info!(step = number, "Using cache");
                    cached += 1;
                }
                Ok(StepOutcome::Metadata) => {}
                Err(e @ DocklingError::Cancelled(_)) => {
                    tracing::warn!(step = number, "Build cancelled");
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!(step = number, instruction = %canonical, error = %e, "Build step failed");
                    return Err(DocklingError::BuildError {
                        step: number,
                        instruction: canonical,
                        cause: e.to_string(),
                    });
                }
            }
        }

        let stage = current.ok_or_else(|| {
            DocklingError::RecipeError("Dockerfile has no FROM instruction".to_string())
        })?;

        let unused: Vec<&String> = options
            .build_args
            .keys()
            .filter(|k| !global_args.contains_key(*k) && !stage.args.contains_key(*k))
            .filter(|k| !stages.iter().any(|s| s.args.contains_key(*k)))
            .collect();
        if !unused.is_empty() {
            tracing::warn!(args = ?unused, "Build args were not consumed");
        }

        let image = Image::new(stage.layers, stage.config, stage.history)?;
        let image_id = image.id.clone();
        let layers = image.layers.clone();
        self.images.insert(image)?;
        if let Some(reference) = &options.tag {
            self.images.tag(&image_id, reference)?;
        }

        let mut event = EngineEvent::new(events::IMAGE_BUILD, image_id.to_string())
            .with("executed", executed)
            .with("cached", cached);
        if let Some(reference) = &options.tag {
            event = event.with("reference", reference);
        }
        self.events.emit(event);

        tracing::info!(
            image = %image_id.short(),
            layers = layers.len(),
            executed,
            cached,
            "Build complete"
        );

        Ok(BuildReport {
            image_id,
            reference: options.tag.clone(),
            layers,
            executed,
            cached,
        })
    }

    async fn start_stage(
        &self,
        image: &str,
        alias: Option<String>,
        stages: &[Stage],
        global_args: &BTreeMap<String, String>,
    ) -> Result<Stage> {
        if image.eq_ignore_ascii_case("scratch") {
            return Ok(Stage::new(alias, base_key("scratch"), global_args.clone()));
        }

        if let Some(parent) = stages
            .iter()
            .rev()
            .find(|s| s.name.as_deref() == Some(image))
        {
            let mut stage = parent.clone();
            stage.name = alias;
            stage.cmd_inherited = stage.config.cmd.is_some();
            return Ok(stage);
        }

        let base = self.resolve_base(image).await?;
        let mut stage = Stage::new(alias, base_key(base.id.as_str()), global_args.clone());
        stage.snapshot = self.reconstruct(&base.layers).await?;
        stage.layers = base.layers.clone();
        stage.cmd_inherited = base.config.cmd.is_some();
        stage.config = base.config;
        stage.history = base.history;
        Ok(stage)
    }

    async fn resolve_base(&self, image: &str) -> Result<Image> {
        match self.images.resolve(image) {
            Ok(found) => Ok(found),
            Err(DocklingError::NotFound { .. }) => {
                let reference = ImageReference::parse(image)?;
                match &self.base_source {
                    Some(source) => {
                        tracing::info!(image = %reference, "Base image not present locally, fetching");
                        source.fetch(&reference).await
                    }
                    None => Err(DocklingError::not_found("image", reference.to_string())),
                }
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_step(
        &self,
        stage: &mut Stage,
        instruction: &Instruction,
        canonical: &str,
        context: &BuildContext,
        stages: &[Stage],
        global_args: &BTreeMap<String, String>,
        options: &BuildOptions,
    ) -> Result<StepOutcome> {
        if !instruction.produces_layer() {
            apply_metadata(stage, instruction, global_args, options);
            stage.cache_key = chain_key(&stage.cache_key, canonical, "");
            stage.record_history(canonical, true);
            return Ok(StepOutcome::Metadata);
        }

        let workdir = stage.workdir();
        let (inputs, copy_source) = match instruction {
            Instruction::Copy { sources, from, .. } => {
                let source = self.copy_source(from.as_deref(), context, stages).await?;
                let paths = resolve_sources(&source, sources)?;
                let inputs = format!("{}\nworkdir={}", sources_digest(&source, &paths), workdir);
                (inputs, Some((source, paths)))
            }
            Instruction::Run { .. } => {
                let mut inputs = stage.config.env.join("\n");
                inputs.push_str(&format!(
                    "\nworkdir={}\nuser={}",
                    workdir,
                    stage.config.user.as_deref().unwrap_or_default()
                ));
                for (k, v) in &stage.args {
                    inputs.push_str(&format!("\narg:{}={}", k, v));
                }
                (inputs, None)
            }
            _ => (String::new(), None),
        };

        let key = chain_key(&stage.cache_key, canonical, &inputs);

        if let Some(layer) = self.cache_hit(stage, &key, options.no_cache) {
            if let Some(layer) = &layer {
                let changes = self.images.layers().changes(layer)?;
                stage.snapshot.apply(&changes)?;
                stage.layers.push(layer.clone());
            }
            if let Instruction::Workdir { path } = instruction {
                stage.config.working_dir = Some(format!("/{}", resolve_in(&workdir, path)));
            }
            stage.cache_key = key;
            stage.record_history(canonical, layer.is_none());
            return Ok(StepOutcome::Cached);
        }
        stage.cache_broken = true;

        let after = match instruction {
            Instruction::Workdir { path } => {
                let resolved = resolve_in(&workdir, path);
                let mut after = stage.snapshot.clone();
                after.mkdir_all(&resolved)?;
                stage.config.working_dir = Some(format!("/{}", resolved));
                after
            }
            Instruction::Copy { dest, .. } => {
                let (source, paths) = copy_source.ok_or_else(|| {
                    DocklingError::Other("COPY sources were not resolved".to_string())
                })?;
                let mut after = stage.snapshot.clone();
                copy_into(&mut after, &source, &paths, dest, &workdir)?;
                after
            }
            Instruction::Run { command } => {
                let mut env = stage.config.env.clone();
                for (k, v) in &stage.args {
                    if stage.config.env_get(k).is_none() {
                        env.push(format!("{}={}", k, v));
                    }
                }
                let request = RunRequest {
                    rootfs: stage.snapshot.clone(),
                    argv: command.argv(),
                    env,
                    workdir: workdir.clone(),
                    user: stage.config.user.clone(),
                };
                self.runner.run(request).await?
            }
            other => {
                return Err(DocklingError::Other(format!(
                    "unexpected layer instruction {}",
                    other
                )))
            }
        };

        let changes = stage.snapshot.diff(&after);
        let layer = if changes.is_empty() {
            None
        } else {
            Some(self.images.layers().put_changes(&changes)?)
        };
        self.cache.record(
            &key,
            CacheRecord {
                layer: layer.clone(),
                created_by: canonical.to_string(),
                created: Utc::now(),
            },
        )?;

        if let Some(layer) = &layer {
            tracing::debug!(layer = %layer.short(), upserts = changes.upserts.len(), deletions = changes.deletions.len(), "Produced layer");
            stage.layers.push(layer.clone());
        }
        stage.snapshot = after;
        stage.cache_key = key;
        stage.record_history(canonical, layer.is_none());
        Ok(StepOutcome::Executed)
    }

    /// `Some(layer)` on a usable cache hit (`Some(None)` = hit without a layer).
    fn cache_hit(&self, stage: &Stage, key: &str, no_cache: bool) -> Option<Option<LayerId>> {
        if no_cache || stage.cache_broken {
            return None;
        }
        let record = self.cache.lookup(key)?;
        match record.layer {
            None => Some(None),
            Some(layer) if self.images.layers().contains(&layer) => Some(Some(layer)),
            Some(layer) => {
                tracing::debug!(layer = %layer, "Cached layer no longer stored, executing");
                None
            }
        }
    }

    async fn copy_source<'a>(
        &self,
        from: Option<&str>,
        context: &'a BuildContext,
        stages: &'a [Stage],
    ) -> Result<Cow<'a, Snapshot>> {
        let Some(from) = from else {
            return Ok(Cow::Borrowed(context.snapshot()));
        };

        if let Some(stage) = stages.iter().rev().find(|s| s.name.as_deref() == Some(from)) {
            return Ok(Cow::Borrowed(&stage.snapshot));
        }
        if let Ok(index) = from.parse::<usize>() {
            return stages
                .get(index)
                .map(|s| Cow::Borrowed(&s.snapshot))
                .ok_or_else(|| DocklingError::not_found("build stage", from));
        }

        let image = self.resolve_base(from).await?;
        Ok(Cow::Owned(self.reconstruct(&image.layers).await?))
    }

    async fn reconstruct(&self, layers: &[LayerId]) -> Result<Snapshot> {
        let store = self.images.layers().clone();
        let layers = layers.to_vec();
        blocking("reconstruct", move || store.reconstruct(&layers)).await
    }
}

fn apply_metadata(
    stage: &mut Stage,
    instruction: &Instruction,
    global_args: &BTreeMap<String, String>,
    options: &BuildOptions,
) {
    let config = &mut stage.config;
    match instruction {
        Instruction::Env { vars } => {
            for (key, value) in vars {
                config.set_env(key, value);
            }
        }
        Instruction::Label { labels } => {
            for (key, value) in labels {
                config.labels.insert(key.clone(), value.clone());
            }
        }
        Instruction::Expose { ports } => {
            for port in ports {
                let port = if port.contains('/') {
                    port.clone()
                } else {
                    format!("{}/tcp", port)
                };
                config.exposed_ports.insert(port);
            }
        }
        Instruction::User { user } => config.user = Some(user.clone()),
        Instruction::Entrypoint { exec } => {
            config.entrypoint = Some(exec.clone());
            if stage.cmd_inherited {
                config.cmd = None;
                stage.cmd_inherited = false;
            }
        }
        Instruction::Cmd { exec } => {
            config.cmd = Some(exec.clone());
            stage.cmd_inherited = false;
        }
        Instruction::Arg { name, default } => {
            let value = options
                .build_args
                .get(name)
                .or(default.as_ref())
                .or_else(|| global_args.get(name));
            if let Some(value) = value {
                stage.args.insert(name.clone(), value.clone());
            }
        }
        Instruction::From { .. }
        | Instruction::Run { .. }
        | Instruction::Copy { .. }
        | Instruction::Workdir { .. } => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::MemoryTagStore;
    use crate::layer::{LayerStore, Node};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Runner that interprets `touch <path>` / `fail` / `echo <text> > <path>`
    /// against the snapshot and records each invocation.
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, request: RunRequest) -> Result<Snapshot> {
            let script = request.argv.last().cloned().unwrap_or_default();
            self.calls.lock().push(script.clone());
            let mut rootfs = request.rootfs;
            let words: Vec<&str> = script.split_whitespace().collect();
            match words.as_slice() {
                ["fail", ..] => Err(DocklingError::ProcessError("exit status 1".to_string())),
                ["touch", path] => {
                    rootfs.write_file(&resolve_in(&request.workdir, path), "", 0o644)?;
                    Ok(rootfs)
                }
                ["echo", text, ">", path] => {
                    rootfs.write_file(&resolve_in(&request.workdir, path), *text, 0o644)?;
                    Ok(rootfs)
                }
                ["env", ">", path] => {
                    rootfs.write_file(
                        &resolve_in(&request.workdir, path),
                        request.env.join("\n"),
                        0o644,
                    )?;
                    Ok(rootfs)
                }
                _ => Ok(rootfs),
            }
        }
    }

    struct Fixture {
        _tmp: TempDir,
        images: Arc<ImageStore>,
        runner: Arc<FakeRunner>,
        builder: Builder,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layers = Arc::new(LayerStore::open(&tmp.path().join("layers")).unwrap());
        let images = Arc::new(
            ImageStore::open(
                &tmp.path().join("images"),
                layers,
                Arc::new(MemoryTagStore::new()),
            )
            .unwrap(),
        );
        let cache = Arc::new(BuildCache::open(&tmp.path().join("build-cache.json")).unwrap());
        let runner = Arc::new(FakeRunner::default());
        let builder = Builder::new(images.clone(), cache, runner.clone());
        Fixture {
            _tmp: tmp,
            images,
            runner,
            builder,
        }
    }

    fn context(files: &[(&str, &str)]) -> BuildContext {
        let mut snapshot = Snapshot::new();
        for (path, content) in files {
            snapshot.write_file(path, *content, 0o644).unwrap();
        }
        BuildContext::from_snapshot(snapshot)
    }

    async fn build(f: &Fixture, recipe: &str, ctx: &BuildContext) -> Result<BuildReport> {
        let options = BuildOptions {
            tag: Some(ImageReference::parse("test/app:latest").unwrap()),
            ..Default::default()
        };
        f.builder
            .build(
                &Dockerfile::parse(recipe).unwrap(),
                ctx,
                &options,
                &CancellationToken::new(),
            )
            .await
    }

    const RECIPE: &str = "FROM scratch
WORKDIR /app
COPY a.txt /app/a.txt
COPY b.txt /app/b.txt
RUN touch /app/c.txt
ENV MODE=prod
CMD [\"/app/run\"]
";

    #[tokio::test]
    async fn test_build_produces_image_and_tag() {
        let f = fixture();
        let ctx = context(&[("a.txt", "A"), ("b.txt", "B")]);
        let report = build(&f, RECIPE, &ctx).await.unwrap();

        assert_eq!(report.executed, 4);
        assert_eq!(report.cached, 0);
        assert_eq!(report.layers.len(), 4);

        let image = f.images.resolve("test/app:latest").unwrap();
        assert_eq!(image.id, report.image_id);
        assert_eq!(image.config.working_dir.as_deref(), Some("/app"));
        assert_eq!(image.config.env_get("MODE"), Some("prod"));
        assert_eq!(image.config.cmd, Some(vec!["/app/run".to_string()]));
        assert_eq!(image.history.len(), 6);

        let rootfs = f.images.layers().reconstruct(&image.layers).unwrap();
        assert_eq!(rootfs.get("app/a.txt"), Some(&Node::file("A", 0o644)));
        assert!(rootfs.get("app/c.txt").is_some());
    }

    #[tokio::test]
    async fn test_rebuild_is_fully_cached_and_identical() {
        let f = fixture();
        let ctx = context(&[("a.txt", "A"), ("b.txt", "B")]);
        let first = build(&f, RECIPE, &ctx).await.unwrap();
        let second = build(&f, RECIPE, &ctx).await.unwrap();

        assert_eq!(second.image_id, first.image_id);
        assert_eq!(second.layers, first.layers);
        assert_eq!(second.executed, 0);
        assert_eq!(second.cached, 4);
        assert_eq!(f.runner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_changed_source_invalidates_from_that_step() {
        let f = fixture();
        let first = build(&f, RECIPE, &context(&[("a.txt", "A"), ("b.txt", "B")]))
            .await
            .unwrap();
        let second = build(&f, RECIPE, &context(&[("a.txt", "A"), ("b.txt", "B2")]))
            .await
            .unwrap();

        // WORKDIR and COPY a.txt reused; COPY b.txt and RUN re-executed.
        assert_eq!(second.cached, 2);
        assert_eq!(second.executed, 2);
        assert_eq!(second.layers[..2], first.layers[..2]);
        assert_ne!(second.layers[2], first.layers[2]);
        assert_ne!(second.image_id, first.image_id);
        assert_eq!(f.runner.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_no_cache_executes_everything() {
        let f = fixture();
        let ctx = context(&[("a.txt", "A"), ("b.txt", "B")]);
        build(&f, RECIPE, &ctx).await.unwrap();

        let options = BuildOptions {
            no_cache: true,
            ..Default::default()
        };
        let report = f
            .builder
            .build(
                &Dockerfile::parse(RECIPE).unwrap(),
                &ctx,
                &options,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.executed, 4);
        assert_eq!(report.cached, 0);
    }

    #[tokio::test]
    async fn test_failed_step_registers_nothing() {
        let f = fixture();
        let recipe = "FROM scratch\nCOPY a.txt /a.txt\nRUN fail now\nCMD [\"x\"]\n";
        let err = build(&f, recipe, &context(&[("a.txt", "A")]))
            .await
            .unwrap_err();

        match err {
            DocklingError::BuildError {
                step, instruction, ..
            } => {
                assert_eq!(step, 3);
                assert_eq!(instruction, "RUN fail now");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.images.list().unwrap().is_empty());
        assert!(f.images.resolve("test/app:latest").is_err());
    }

    #[tokio::test]
    async fn test_missing_copy_source_fails_build() {
        let f = fixture();
        let err = build(&f, "FROM scratch\nCOPY missing.txt /\n", &context(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, DocklingError::BuildError { step: 2, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_build() {
        let f = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = f
            .builder
            .build(
                &Dockerfile::parse(RECIPE).unwrap(),
                &context(&[]),
                &BuildOptions::default(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DocklingError::Cancelled(1)));
        assert!(f.images.list().unwrap().is_empty());
    }

    /// Runner that asks for cancellation while its command is running.
    struct InterruptedRunner {
        cancel: CancellationToken,
        finished: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for InterruptedRunner {
        async fn run(&self, request: RunRequest) -> Result<Snapshot> {
            self.cancel.cancel();
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            let mut rootfs = request.rootfs;
            rootfs.write_file("done", "", 0o644)?;
            Ok(rootfs)
        }
    }

    #[tokio::test]
    async fn test_cancel_lets_running_instruction_finish() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let runner = Arc::new(InterruptedRunner {
            cancel: cancel.clone(),
            finished: AtomicUsize::new(0),
        });
        let cache = Arc::new(BuildCache::open(&f._tmp.path().join("other-cache.json")).unwrap());
        let builder = Builder::new(f.images.clone(), cache, runner.clone());

        let err = builder
            .build(
                &Dockerfile::parse("FROM scratch\nRUN first\nRUN second\n").unwrap(),
                &context(&[]),
                &BuildOptions::default(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DocklingError::Cancelled(3)), "{err}");
        assert_eq!(runner.finished.load(Ordering::SeqCst), 1);
        assert!(f.images.list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_multi_stage_copy_from() {
        let f = fixture();
        let recipe = "FROM scratch AS builder
WORKDIR /src
RUN echo binary > out/app
FROM scratch
COPY --from=builder /src/out/app /usr/bin/app
";
        let report = build(&f, recipe, &context(&[])).await.unwrap();
        let image = f.images.get(&report.image_id).unwrap();
        // Only the final stage's layers make up the image.
        assert_eq!(image.layers.len(), 1);
        let rootfs = f.images.layers().reconstruct(&image.layers).unwrap();
        assert_eq!(rootfs.get("usr/bin/app"), Some(&Node::file("binary", 0o644)));
        assert!(rootfs.get("src").is_none());
    }

    #[tokio::test]
    async fn test_build_on_local_base_image() {
        let f = fixture();
        build(&f, "FROM scratch\nCOPY a.txt /base.txt\nCMD [\"base\"]\n", &context(&[("a.txt", "A")]))
            .await
            .unwrap();

        let options = BuildOptions {
            tag: Some(ImageReference::parse("test/child").unwrap()),
            ..Default::default()
        };
        let report = f
            .builder
            .build(
                &Dockerfile::parse("FROM test/app\nENTRYPOINT [\"/bin/run\"]\nRUN touch child.txt\n").unwrap(),
                &context(&[]),
                &options,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let image = f.images.get(&report.image_id).unwrap();
        assert_eq!(image.layers.len(), 2);
        // ENTRYPOINT resets the inherited CMD.
        assert_eq!(image.config.cmd, None);
        let rootfs = f.images.layers().reconstruct(&image.layers).unwrap();
        assert!(rootfs.get("base.txt").is_some());
        assert!(rootfs.get("child.txt").is_some());
    }

    #[tokio::test]
    async fn test_missing_base_image_without_source() {
        let f = fixture();
        let err = build(&f, "FROM alpine:3.19\nRUN touch x\n", &context(&[]))
            .await
            .unwrap_err();
        match err {
            DocklingError::BuildError { step, cause, .. } => {
                assert_eq!(step, 1);
                assert!(cause.contains("alpine"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_build_args_expand_and_reach_run() {
        let f = fixture();
        let recipe = "ARG VERSION=1.0
FROM scratch
ARG VERSION
ARG TARGET=/opt
WORKDIR ${TARGET}/v$VERSION
RUN env > env.txt
";
        let mut options = BuildOptions::default();
        options.build_args.insert("VERSION".to_string(), "2.5".to_string());
        let report = f
            .builder
            .build(
                &Dockerfile::parse(recipe).unwrap(),
                &context(&[]),
                &options,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let image = f.images.get(&report.image_id).unwrap();
        assert_eq!(image.config.working_dir.as_deref(), Some("/opt/v2.5"));
        let rootfs = f.images.layers().reconstruct(&image.layers).unwrap();
        match rootfs.get("opt/v2.5/env.txt") {
            Some(Node::File { content, .. }) => {
                let env = String::from_utf8_lossy(content);
                assert!(env.contains("VERSION=2.5"), "{}", env);
            }
            other => panic!("unexpected node: {:?}", other),
        }
        // Build args are not baked into the image environment.
        assert_eq!(image.config.env_get("VERSION"), None);
    }
}
