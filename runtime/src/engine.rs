//! Engine facade: wires the stores, builder, container manager and registry
//! client over one root directory.
//!
//! ```text
//! <root>/layers/sha256/<hex>      layer content
//! <root>/layers/refs.json         reference counts
//! <root>/images/<hex>.json        image records
//! <root>/tags.json                tag -> image id
//! <root>/build-cache.json         build cache index
//! <root>/containers/<id>/         config.json, rootfs/, console.log
//! <root>/auth/credentials.json    registry credentials
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dockling_core::error::{DocklingError, Result};
use dockling_core::event::{events, EngineEvent, EventEmitter};
use dockling_core::{EngineConfig, IsolationMode};
use tokio_util::sync::CancellationToken;

use crate::build::{
    BuildCache, BuildContext, BuildOptions, BuildReport, Builder, CommandRunner, Dockerfile,
    HostCommandRunner,
};
use crate::container::{
    ContainerConfig, ContainerManager, ContainerRecord, HostLauncher, ProcessLauncher,
};
use crate::digest::ImageId;
use crate::image::{FileTagStore, ImageReference, ImageStore};
use crate::layer::LayerStore;
use crate::registry::{
    CredentialStore, HttpTransport, PullReport, PushReport, RegistryClient, RegistryTransport,
    RetryPolicy,
};

pub const LAYERS_DIR: &str = "layers";
pub const IMAGES_DIR: &str = "images";
pub const TAGS_FILE: &str = "tags.json";
pub const BUILD_CACHE_FILE: &str = "build-cache.json";
pub const CONTAINERS_DIR: &str = "containers";
/// Scratch space for build commands
pub const TMP_DIR: &str = "tmp";

/// Default recipe file name inside a build context.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// Result of `rmi`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveImageReport {
    /// Tags removed
    pub untagged: Vec<String>,
    /// Image deleted, if it was
    pub deleted: Option<ImageId>,
    /// Layers garbage-collected with it
    pub layers_removed: usize,
}

/// Pluggable process and network backends.
pub struct Backends {
    pub runner: Arc<dyn CommandRunner>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub transport: Arc<dyn RegistryTransport>,
}

impl Backends {
    /// Host processes and the HTTP registry transport.
    pub fn host(config: &EngineConfig) -> Result<Self> {
        Ok(Self {
            runner: Arc::new(HostCommandRunner::new(config.isolation, config.root.join(TMP_DIR))),
            launcher: Arc::new(HostLauncher::new()),
            transport: Arc::new(HttpTransport::new(
                config,
                CredentialStore::under_root(&config.root),
            )?),
        })
    }
}

/// The container engine.
pub struct Engine {
    config: EngineConfig,
    images: Arc<ImageStore>,
    builder: Builder,
    containers: ContainerManager,
    registry: Arc<RegistryClient>,
    credentials: CredentialStore,
    events: EventEmitter,
}

impl Engine {
    /// Open the engine with host backends.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let backends = Backends::host(&config)?;
        Self::with_backends(config, backends).await
    }

    /// Open the engine with the given backends.
    pub async fn with_backends(config: EngineConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let root = &config.root;
        std::fs::create_dir_all(root).map_err(|e| {
            DocklingError::ConfigError(format!("cannot create root {}: {}", root.display(), e))
        })?;

        let events = EventEmitter::default();
        let layers = Arc::new(LayerStore::open(&root.join(LAYERS_DIR))?);
        let tags = Arc::new(FileTagStore::open(&root.join(TAGS_FILE))?);
        let images = Arc::new(ImageStore::open(&root.join(IMAGES_DIR), layers, tags)?);

        let registry = Arc::new(
            RegistryClient::new(backends.transport, images.clone(), RetryPolicy::from(&config.retry))
                .with_events(events.clone()),
        );
        let cache = Arc::new(BuildCache::open(&root.join(BUILD_CACHE_FILE))?);
        let builder = Builder::new(images.clone(), cache, backends.runner)
            .with_base_source(registry.clone())
            .with_events(events.clone());

        let containers = ContainerManager::new(
            &root.join(CONTAINERS_DIR),
            images.clone(),
            backends.launcher,
            config.isolation,
        )
        .with_events(events.clone());
        containers.load().await?;

        if config.isolation == IsolationMode::Process {
            tracing::warn!("Process isolation runs commands on the host filesystem; use it for development only");
        }
        tracing::debug!(root = %root.display(), "Engine opened");
        Ok(Self {
            credentials: CredentialStore::under_root(root),
            config,
            images,
            builder,
            containers,
            registry,
            events,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn images(&self) -> &Arc<ImageStore> {
        &self.images
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    pub fn registry(&self) -> &RegistryClient {
        &self.registry
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    /// Default `stop` timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.config.stop_timeout_secs)
    }

    /// Build the recipe at `dockerfile` (default `<context>/Dockerfile`).
    pub async fn build(
        &self,
        context_dir: &Path,
        dockerfile: Option<&Path>,
        options: &BuildOptions,
        cancel: &CancellationToken,
    ) -> Result<BuildReport> {
        let recipe_path: PathBuf = match dockerfile {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => context_dir.join(path),
            None => context_dir.join(DEFAULT_DOCKERFILE),
        };
        let recipe = Dockerfile::from_file(&recipe_path)?;
        let context = BuildContext::load(context_dir)?;
        self.builder.build(&recipe, &context, options, cancel).await
    }

    /// Local image id for `query`, pulling it when it names a remote image
    /// that is not present.
    pub async fn ensure_image(&self, query: &str) -> Result<ImageId> {
        match self.images.resolve(query) {
            Ok(image) => Ok(image.id),
            Err(DocklingError::NotFound { .. }) => {
                let reference = ImageReference::parse(query)
                    .map_err(|_| DocklingError::not_found("image", query))?;
                tracing::info!(reference = %reference, "Image not present locally, pulling");
                Ok(self.registry.pull(&reference).await?.image_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a container, pulling its image if needed.
    pub async fn create(
        &self,
        image: &str,
        overrides: &ContainerConfig,
        name: Option<&str>,
    ) -> Result<ContainerRecord> {
        self.ensure_image(image).await?;
        self.containers.create(image, overrides, name).await
    }

    /// Create and start a container.
    pub async fn run(
        &self,
        image: &str,
        overrides: &ContainerConfig,
        name: Option<&str>,
    ) -> Result<ContainerRecord> {
        let record = self.create(image, overrides, name).await?;
        match self.containers.start(&record.id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                if overrides.auto_remove {
                    if let Err(cleanup) = self.containers.remove(&record.id, true).await {
                        tracing::warn!(container = %record.id, error = %cleanup, "Auto-remove failed");
                    }
                }
                Err(e)
            }
        }
    }

    /// Point `target` at the image `source` resolves to.
    pub fn tag(&self, source: &str, target: &str) -> Result<ImageId> {
        let image = self.images.resolve(source)?;
        let reference = ImageReference::parse(target)?;
        self.images.tag(&image.id, &reference)?;
        self.events.emit(
            EngineEvent::new(events::IMAGE_TAG, image.id.to_string()).with("reference", &reference),
        );
        Ok(image.id)
    }

    pub async fn push(&self, reference: &str) -> Result<PushReport> {
        let destination = ImageReference::parse(reference)?;
        self.registry.push(reference, &destination).await
    }

    pub async fn pull(&self, reference: &str) -> Result<PullReport> {
        let source = ImageReference::parse(reference)?;
        self.registry.pull(&source).await
    }

    /// Remove an image reference.
    ///
    /// A tag is removed first. The image itself is deleted (and its layers
    /// collected) once no tag references it and no container was created
    /// from it, or unconditionally with `force`. Removing by id drops every
    /// tag, which requires `force` when there is more than one.
    pub fn rmi(&self, query: &str, force: bool) -> Result<RemoveImageReport> {
        let image = self.images.resolve(query)?;
        let mut report = RemoveImageReport::default();

        let tags = self.images.tags_for(&image.id)?;
        let by_tag = ImageReference::parse(query)
            .ok()
            .map(|r| r.to_string())
            .filter(|r| tags.contains(r));

        let to_untag: Vec<String> = match by_tag {
            Some(tag) => vec![tag],
            None if tags.len() > 1 && !force => {
                return Err(DocklingError::Other(format!(
                    "image {} is referenced by {} tags; remove them individually or use --force",
                    image.id.short(),
                    tags.len()
                )))
            }
            None => tags,
        };

        for tag in to_untag {
            let reference = ImageReference::parse(&tag)?;
            self.images.untag(&reference)?;
            self.events.emit(
                EngineEvent::new(events::IMAGE_UNTAG, image.id.to_string()).with("reference", &tag),
            );
            report.untagged.push(tag);
        }

        let still_tagged = !self.images.tags_for(&image.id)?.is_empty();
        let in_use = self.containers.uses_image(&image.id);
        if still_tagged {
            return Ok(report);
        }
        if in_use && !force {
            tracing::info!(image = %image.id.short(), "Image kept: used by a container");
            return Ok(report);
        }

        let collected = self.images.remove(&image.id)?;
        if !collected.is_empty() {
            let layers = self.images.layers();
            let pruned = self.builder.cache().prune(|layer| layers.contains(layer))?;
            tracing::debug!(pruned, "Build cache pruned");
        }
        report.layers_removed = collected.len();
        report.deleted = Some(image.id.clone());
        self.events.emit(EngineEvent::new(events::IMAGE_DELETE, image.id.to_string()));
        Ok(report)
    }
}
