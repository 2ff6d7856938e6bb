//! Image push and pull.

use std::future::Future;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockling_core::error::{DocklingError, Result};
use dockling_core::event::{events, EngineEvent, EventEmitter};
use dockling_core::RetryConfig;

use super::manifest::{
    host_architecture, is_index, ConfigBlob, Descriptor, ImageIndex, Manifest, MEDIA_TYPE_CONFIG,
    MEDIA_TYPE_LAYER, MEDIA_TYPE_MANIFEST,
};
use super::transport::{ManifestResponse, RegistryTransport};
use crate::build::BaseImageSource;
use crate::digest::{Digest, ImageId};
use crate::image::{Image, ImageReference, ImageStore, DEFAULT_TAG};
use crate::layer::diff::is_gzip;

/// Bounded exponential backoff for transient registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `min(base * 2^retry, max)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation = what,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient registry failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Outcome of a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReport {
    pub reference: ImageReference,
    pub manifest_digest: Digest,
    /// Layers uploaded
    pub uploaded: usize,
    /// Layers the registry already had
    pub skipped: usize,
}

/// Outcome of a pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReport {
    pub image_id: ImageId,
    pub reference: ImageReference,
    /// Layers downloaded
    pub downloaded: usize,
    /// Layers already present locally
    pub skipped: usize,
}

/// Moves images between the local store and a registry.
pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    images: Arc<ImageStore>,
    retry: RetryPolicy,
    events: EventEmitter,
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn RegistryTransport>, images: Arc<ImageStore>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            images,
            retry,
            events: EventEmitter::default(),
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    /// Upload a local image to `destination`. Blobs the registry already
    /// has are not uploaded again; the manifest is written last.
    pub async fn push(&self, image_query: &str, destination: &ImageReference) -> Result<PushReport> {
        let image = self.images.resolve(image_query)?;
        let layers = self.images.layers();
        let transport = &self.transport;
        tracing::info!(image = %image.id.short(), destination = %destination, "Pushing image");

        let mut descriptors = Vec::with_capacity(image.layers.len());
        let (mut uploaded, mut skipped) = (0, 0);
        for layer in &image.layers {
            let size = layers.size(layer)?;
            let exists = self
                .retry
                .run("blob check", || transport.blob_exists(destination, layer))
                .await?;
            if exists {
                tracing::debug!(layer = %layer.short(), "Layer already present in registry");
                skipped += 1;
            } else {
                let data = layers.get(layer)?;
                self.retry
                    .run("blob upload", || transport.put_blob(destination, layer, data.clone()))
                    .await?;
                tracing::info!(layer = %layer.short(), size, "Uploaded layer");
                uploaded += 1;
            }
            descriptors.push(Descriptor {
                media_type: MEDIA_TYPE_LAYER.to_string(),
                digest: layer.clone(),
                size,
                platform: None,
            });
        }

        let config = serde_json::to_vec(&ConfigBlob::from_image(&image))?;
        let config_descriptor = Descriptor::new(MEDIA_TYPE_CONFIG, &config);
        let config_exists = self
            .retry
            .run("config check", || transport.blob_exists(destination, &config_descriptor.digest))
            .await?;
        if !config_exists {
            self.retry
                .run("config upload", || {
                    transport.put_blob(destination, &config_descriptor.digest, config.clone())
                })
                .await?;
        }

        let manifest = serde_json::to_vec(&Manifest::new(config_descriptor, descriptors))?;
        let manifest_digest = Digest::of(&manifest);
        let tag = destination.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string());
        self.retry
            .run("manifest upload", || {
                transport.put_manifest(destination, &tag, MEDIA_TYPE_MANIFEST, manifest.clone())
            })
            .await?;

        tracing::info!(destination = %destination, digest = %manifest_digest, uploaded, skipped, "Pushed image");
        self.events.emit(
            EngineEvent::new(events::IMAGE_PUSH, image.id.to_string())
                .with("reference", destination)
                .with("digest", &manifest_digest),
        );
        Ok(PushReport {
            reference: destination.clone(),
            manifest_digest,
            uploaded,
            skipped,
        })
    }

    /// Download `source` into the local store and tag it. Layers already
    /// present locally are not downloaded.
    pub async fn pull(&self, source: &ImageReference) -> Result<PullReport> {
        tracing::info!(reference = %source, "Pulling image");
        let manifest = self.fetch_manifest(source).await?;

        let config_bytes = self.fetch_blob(source, &manifest.config.digest).await?;
        let config: ConfigBlob = serde_json::from_slice(&config_bytes)?;
        let diff_ids = &config.rootfs.diff_ids;
        if diff_ids.len() != manifest.layers.len() {
            return Err(registry_error(
                source,
                format!(
                    "manifest lists {} layers but config has {} diff ids",
                    manifest.layers.len(),
                    diff_ids.len()
                ),
            ));
        }

        let layers = self.images.layers();
        // Downloaded layers stay unreferenced until the image is inserted.
        let _lease = layers.lease()?;
        let (mut downloaded, mut skipped) = (0, 0);
        for (descriptor, diff_id) in manifest.layers.iter().zip(diff_ids) {
            if layers.contains(diff_id) {
                tracing::debug!(layer = %diff_id.short(), "Layer already present locally");
                skipped += 1;
                continue;
            }

            let blob = self.fetch_blob(source, &descriptor.digest).await?;
            let content = if is_gzip(&blob) { gunzip(&blob)? } else { blob };
            let stored = layers.put(&content)?;
            if stored != *diff_id {
                return Err(registry_error(
                    source,
                    format!("layer {} does not match diff id {}", descriptor.digest, diff_id),
                ));
            }
            tracing::info!(layer = %diff_id.short(), size = content.len(), "Downloaded layer");
            downloaded += 1;
        }

        let mut image = Image::new(diff_ids.clone(), config.image_config(), config.image_history())?;
        if let Some(created) = config.created {
            image.created = created;
        }
        let image_id = image.id.clone();
        self.images.insert(image)?;

        let reference = match (&source.tag, &source.digest) {
            (Some(tag), _) => Some(source.with_tag(tag)),
            (None, Some(_)) => None,
            (None, None) => Some(source.with_tag(DEFAULT_TAG)),
        };
        if let Some(reference) = &reference {
            self.images.tag(&image_id, reference)?;
        }

        tracing::info!(reference = %source, image = %image_id.short(), downloaded, skipped, "Pulled image");
        self.events.emit(
            EngineEvent::new(events::IMAGE_PULL, image_id.to_string()).with("reference", source),
        );
        Ok(PullReport {
            image_id,
            reference: reference.unwrap_or_else(|| source.clone()),
            downloaded,
            skipped,
        })
    }

    async fn fetch_blob(&self, source: &ImageReference, digest: &Digest) -> Result<Vec<u8>> {
        let transport = &self.transport;
        let blob = self
            .retry
            .run("blob download", || transport.get_blob(source, digest))
            .await?;
        if Digest::of(&blob) != *digest {
            return Err(registry_error(source, format!("blob {} failed digest verification", digest)));
        }
        Ok(blob)
    }

    async fn get_manifest(&self, source: &ImageReference, reference: &str) -> Result<ManifestResponse> {
        let transport = &self.transport;
        let response = self
            .retry
            .run("manifest download", || transport.get_manifest(source, reference))
            .await?;
        if let Ok(expected) = Digest::parse(reference) {
            if Digest::of(&response.body) != expected {
                return Err(registry_error(
                    source,
                    format!("manifest {} failed digest verification", reference),
                ));
            }
        }
        Ok(response)
    }

    /// The single-platform manifest for `source`, resolving an index to the
    /// linux manifest for the host architecture.
    async fn fetch_manifest(&self, source: &ImageReference) -> Result<Manifest> {
        let response = self.get_manifest(source, &source.manifest_reference()).await?;
        let response = if describes_index(&response)? {
            let index: ImageIndex = serde_json::from_slice(&response.body)?;
            let arch = host_architecture();
            let entry = index.select("linux", arch).ok_or_else(|| {
                registry_error(source, format!("no manifest for linux/{} in index", arch))
            })?;
            tracing::debug!(digest = %entry.digest, arch, "Selected platform manifest");
            self.get_manifest(source, entry.digest.as_str()).await?
        } else {
            response
        };
        Ok(serde_json::from_slice(&response.body)?)
    }
}

#[async_trait]
impl BaseImageSource for RegistryClient {
    async fn fetch(&self, reference: &ImageReference) -> Result<Image> {
        let report = self.pull(reference).await?;
        self.images.get(&report.image_id)
    }
}

fn describes_index(response: &ManifestResponse) -> Result<bool> {
    if !response.media_type.is_empty() && response.media_type != "application/json" {
        return Ok(is_index(&response.media_type));
    }
    let value: serde_json::Value = serde_json::from_slice(&response.body)?;
    Ok(match value.get("mediaType").and_then(|m| m.as_str()) {
        Some(media_type) => is_index(media_type),
        None => value.get("manifests").is_some(),
    })
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

fn registry_error(reference: &ImageReference, message: String) -> DocklingError {
    DocklingError::RegistryError {
        registry: reference.registry.clone(),
        message,
    }
}
