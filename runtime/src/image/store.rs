//! Local image store.
//!
//! Images are persisted one JSON record per image under `images/<hex>.json`.
//! Inserting a new image takes one reference on every layer occurrence in
//! its stack; removing it drops them again.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dockling_core::error::{DocklingError, Result};
use parking_lot::RwLock;

use super::model::Image;
use super::reference::ImageReference;
use super::tags::TagStore;
use crate::digest::{Digest, ImageId, LayerId};
use crate::fs::{read_json, write_json};
use crate::layer::LayerStore;

/// Listing entry for `images`.
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub id: ImageId,
    /// Tags pointing at the image (normalized references)
    pub tags: Vec<String>,
    pub created: DateTime<Utc>,
    /// Sum of layer sizes
    pub size: u64,
    pub layers: usize,
}

/// Persistent collection of images plus their tags.
pub struct ImageStore {
    dir: PathBuf,
    images: RwLock<HashMap<ImageId, Image>>,
    layers: Arc<LayerStore>,
    tags: Arc<dyn TagStore>,
}

impl ImageStore {
    /// Open the store at `dir`, loading every image record.
    pub fn open(dir: &Path, layers: Arc<LayerStore>, tags: Arc<dyn TagStore>) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut images = HashMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Image>(&path) {
                Ok(Some(image)) => {
                    images.insert(image.id.clone(), image);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable image record")
                }
            }
        }
        tracing::debug!(count = images.len(), "Loaded image records");

        Ok(Self {
            dir: dir.to_path_buf(),
            images: RwLock::new(images),
            layers,
            tags,
        })
    }

    fn record_path(&self, id: &ImageId) -> PathBuf {
        self.dir.join(format!("{}.json", id.hex()))
    }

    pub fn layers(&self) -> &Arc<LayerStore> {
        &self.layers
    }

    pub fn tags(&self) -> &Arc<dyn TagStore> {
        &self.tags
    }

    /// Register an image. Returns `false` if it was already present.
    ///
    /// Layers are checked and referenced under a lease, so a concurrent
    /// collection cannot remove them in between.
    pub fn insert(&self, image: Image) -> Result<bool> {
        let _lease = self.layers.lease()?;
        for layer in &image.layers {
            if !self.layers.contains(layer) {
                return Err(DocklingError::not_found("layer", layer.to_string()));
            }
        }

        let mut images = self.images.write();
        if images.contains_key(&image.id) {
            return Ok(false);
        }

        write_json(&self.record_path(&image.id), &image)?;
        for layer in &image.layers {
            self.layers.incref(layer)?;
        }
        tracing::debug!(image = %image.id, layers = image.layers.len(), "Registered image");
        images.insert(image.id.clone(), image);
        Ok(true)
    }

    /// Image by exact id.
    pub fn get(&self, id: &ImageId) -> Result<Image> {
        self.images
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DocklingError::not_found("image", id.to_string()))
    }

    pub fn contains(&self, id: &ImageId) -> bool {
        self.images.read().contains_key(id)
    }

    /// Resolve a tag reference, full id, or unique id prefix.
    pub fn resolve(&self, query: &str) -> Result<Image> {
        if let Ok(id) = Digest::parse(query) {
            return self.get(&id);
        }

        if let Ok(reference) = ImageReference::parse(query) {
            if let Some(id) = self.tags.get(&reference.to_string())? {
                return self.get(&id);
            }
        }

        let prefix = query.strip_prefix("sha256:").unwrap_or(query);
        if !prefix.is_empty() && prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            let prefix = prefix.to_ascii_lowercase();
            let images = self.images.read();
            let matches: Vec<&Image> = images
                .values()
                .filter(|img| img.id.hex().starts_with(&prefix))
                .collect();
            match matches.len() {
                0 => {}
                1 => return Ok(matches[0].clone()),
                count => {
                    return Err(DocklingError::Ambiguous {
                        kind: "image",
                        query: query.to_string(),
                        count,
                    })
                }
            }
        }

        Err(DocklingError::not_found("image", query))
    }

    /// Point `reference` at `id`. Returns the previously tagged image.
    pub fn tag(&self, id: &ImageId, reference: &ImageReference) -> Result<Option<ImageId>> {
        if !self.contains(id) {
            return Err(DocklingError::not_found("image", id.to_string()));
        }
        let previous = self.tags.set(&reference.to_string(), id)?;
        tracing::info!(image = %id.short(), tag = %reference, "Tagged image");
        Ok(previous)
    }

    /// Remove a tag. Returns the image it pointed at.
    pub fn untag(&self, reference: &ImageReference) -> Result<ImageId> {
        self.tags
            .remove(&reference.to_string())?
            .ok_or_else(|| DocklingError::not_found("tag", reference.to_string()))
    }

    /// Tags pointing at `id`.
    pub fn tags_for(&self, id: &ImageId) -> Result<Vec<String>> {
        self.tags.tags_for(id)
    }

    /// Delete an image record and release its layers. Returns layers garbage-collected.
    pub fn remove(&self, id: &ImageId) -> Result<Vec<LayerId>> {
        let image = {
            let mut images = self.images.write();
            let image = images
                .remove(id)
                .ok_or_else(|| DocklingError::not_found("image", id.to_string()))?;
            if let Err(e) = std::fs::remove_file(self.record_path(id)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    images.insert(id.clone(), image);
                    return Err(e.into());
                }
            }
            image
        };

        for layer in &image.layers {
            self.layers.decref(layer)?;
        }
        let collected = self.layers.gc()?;
        tracing::info!(image = %id.short(), layers_removed = collected.len(), "Removed image");
        Ok(collected)
    }

    /// Sum of the image's layer sizes.
    pub fn size(&self, image: &Image) -> u64 {
        image
            .layers
            .iter()
            .filter_map(|l| self.layers.size(l).ok())
            .sum()
    }

    /// All images, newest first.
    pub fn list(&self) -> Result<Vec<ImageSummary>> {
        let tags = self.tags.list()?;
        let images: Vec<Image> = self.images.read().values().cloned().collect();

        let mut summaries: Vec<ImageSummary> = images
            .into_iter()
            .map(|image| ImageSummary {
                tags: tags
                    .iter()
                    .filter(|(_, target)| **target == image.id)
                    .map(|(tag, _)| tag.clone())
                    .collect(),
                size: self.size(&image),
                layers: image.layers.len(),
                created: image.created,
                id: image.id,
            })
            .collect();
        summaries.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| a.id.cmp(&b.id)));
        Ok(summaries)
    }
}
