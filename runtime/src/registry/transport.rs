//! Registry wire operations and an in-process registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use dockling_core::error::{DocklingError, Result};
use parking_lot::Mutex;

use crate::digest::Digest;
use crate::image::ImageReference;

/// A fetched manifest document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestResponse {
    pub media_type: String,
    pub body: Vec<u8>,
}

/// The OCI distribution operations the client needs. The repository (and
/// registry host) come from `image`; blob and manifest references are
/// passed separately.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn blob_exists(&self, image: &ImageReference, digest: &Digest) -> Result<bool>;

    async fn get_blob(&self, image: &ImageReference, digest: &Digest) -> Result<Vec<u8>>;

    async fn put_blob(&self, image: &ImageReference, digest: &Digest, data: Vec<u8>) -> Result<()>;

    /// `reference` is a tag or a digest string.
    async fn get_manifest(&self, image: &ImageReference, reference: &str) -> Result<ManifestResponse>;

    async fn put_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<()>;
}

fn repo_key(image: &ImageReference) -> String {
    format!("{}/{}", image.registry, image.repository)
}

/// In-process registry with failure injection and transfer counters.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    blobs: Mutex<HashMap<(String, Digest), Vec<u8>>>,
    manifests: Mutex<HashMap<(String, String), ManifestResponse>>,
    failures: AtomicU32,
    uploads: AtomicUsize,
    downloads: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` operations with a transient network error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Blobs uploaded so far.
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Blobs downloaded so far.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn has_blob(&self, image: &ImageReference, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(&(repo_key(image), digest.clone()))
    }

    /// Store a blob directly, bypassing the upload counter.
    pub fn seed_blob(&self, image: &ImageReference, data: Vec<u8>) -> Digest {
        let digest = Digest::of(&data);
        self.blobs.lock().insert((repo_key(image), digest.clone()), data);
        digest
    }

    /// Store a manifest directly.
    pub fn seed_manifest(&self, image: &ImageReference, reference: &str, media_type: &str, body: Vec<u8>) {
        self.manifests.lock().insert(
            (repo_key(image), reference.to_string()),
            ManifestResponse {
                media_type: media_type.to_string(),
                body,
            },
        );
    }

    fn check_failure(&self, image: &ImageReference) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DocklingError::NetworkError {
                registry: image.registry.clone(),
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryTransport for MemoryRegistry {
    async fn blob_exists(&self, image: &ImageReference, digest: &Digest) -> Result<bool> {
        self.check_failure(image)?;
        Ok(self.has_blob(image, digest))
    }

    async fn get_blob(&self, image: &ImageReference, digest: &Digest) -> Result<Vec<u8>> {
        self.check_failure(image)?;
        let blob = self
            .blobs
            .lock()
            .get(&(repo_key(image), digest.clone()))
            .cloned()
            .ok_or_else(|| DocklingError::not_found("blob", digest.to_string()))?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(blob)
    }

    async fn put_blob(&self, image: &ImageReference, digest: &Digest, data: Vec<u8>) -> Result<()> {
        self.check_failure(image)?;
        if Digest::of(&data) != *digest {
            return Err(DocklingError::RegistryError {
                registry: image.registry.clone(),
                message: format!("digest mismatch for blob {}", digest),
            });
        }
        self.blobs.lock().insert((repo_key(image), digest.clone()), data);
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_manifest(&self, image: &ImageReference, reference: &str) -> Result<ManifestResponse> {
        self.check_failure(image)?;
        self.manifests
            .lock()
            .get(&(repo_key(image), reference.to_string()))
            .cloned()
            .ok_or_else(|| DocklingError::not_found("manifest", format!("{}:{}", image.repository, reference)))
    }

    async fn put_manifest(
        &self,
        image: &ImageReference,
        reference: &str,
        media_type: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        self.check_failure(image)?;
        let digest = Digest::of(&body);
        let manifest = ManifestResponse {
            media_type: media_type.to_string(),
            body,
        };
        let key = repo_key(image);
        let mut manifests = self.manifests.lock();
        manifests.insert((key.clone(), digest.to_string()), manifest.clone());
        manifests.insert((key, reference.to_string()), manifest);
        Ok(())
    }
}
