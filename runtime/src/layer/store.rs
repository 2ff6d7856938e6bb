//! Content-addressed layer store.
//!
//! Each layer is stored by its digest under `layers/sha256/<hex>`, so a
//! layer shared by several images exists once on disk. Reference counts
//! live in `layers/refs.json` and every change re-reads that file under
//! `refs.lock`, so concurrent engines on one root never lose an update.
//!
//! Builds, pulls and commits hold a [`LayerLease`] (a shared lock on
//! `gc.lock`) from the first `put` until their image is registered.
//! Collection only runs while no lease is held anywhere.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dockling_core::error::{DocklingError, Result};
use serde::{Deserialize, Serialize};

use super::diff::{ChangeSet, Snapshot};
use crate::digest::{Digest, LayerId};
use crate::fs::{read_json, update_json, write_atomic, FileLock};

const REFS_FILE: &str = "refs.json";
const REFS_LOCK: &str = "refs.lock";
const GC_LOCK: &str = "gc.lock";

type RefTable = BTreeMap<String, u64>;

/// Listing entry for a stored layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMeta {
    /// Layer digest
    pub id: LayerId,
    /// Size of the serialized layer in bytes
    pub size: u64,
    /// Number of images referencing the layer
    pub refs: u64,
}

/// Keeps unreferenced layers alive while an image is being assembled.
pub struct LayerLease {
    _lock: FileLock,
}

/// Content-addressed store of immutable layers.
pub struct LayerStore {
    /// Root directory (`<root>/layers`)
    dir: PathBuf,
}

impl LayerStore {
    /// Open (or create) a layer store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir.join("sha256")).map_err(|e| {
            DocklingError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create layer directory {}: {}", dir.display(), e),
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn blob_path(&self, id: &LayerId) -> PathBuf {
        self.dir.join("sha256").join(id.hex())
    }

    /// Protect layers from collection until the lease is dropped.
    pub fn lease(&self) -> Result<LayerLease> {
        Ok(LayerLease {
            _lock: FileLock::shared(&self.dir.join(GC_LOCK))?,
        })
    }

    /// Store serialized layer content. Storing existing content is a no-op.
    pub fn put(&self, content: &[u8]) -> Result<LayerId> {
        let id = Digest::of(content);
        let path = self.blob_path(&id);
        if path.is_file() {
            tracing::trace!(layer = %id, "Layer already stored");
            return Ok(id);
        }

        write_atomic(&path, content)?;
        tracing::debug!(layer = %id, size = content.len(), "Stored layer");
        Ok(id)
    }

    /// Serialize and store a change set.
    pub fn put_changes(&self, changes: &ChangeSet) -> Result<LayerId> {
        self.put(&changes.to_tar()?)
    }

    /// Read serialized layer content.
    pub fn get(&self, id: &LayerId) -> Result<Vec<u8>> {
        std::fs::read(self.blob_path(id)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DocklingError::not_found("layer", id.to_string()),
            _ => e.into(),
        })
    }

    /// Decode a stored layer into its change set.
    pub fn changes(&self, id: &LayerId) -> Result<ChangeSet> {
        ChangeSet::from_tar(&self.get(id)?)
    }

    /// Rebuild the filesystem of a layer stack (bottom to top).
    pub fn reconstruct(&self, layers: &[LayerId]) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for id in layers {
            snapshot.apply(&self.changes(id)?)?;
        }
        Ok(snapshot)
    }

    pub fn contains(&self, id: &LayerId) -> bool {
        self.blob_path(id).is_file()
    }

    /// Size of a stored layer in bytes.
    pub fn size(&self, id: &LayerId) -> Result<u64> {
        std::fs::metadata(self.blob_path(id))
            .map(|m| m.len())
            .map_err(|_| DocklingError::not_found("layer", id.to_string()))
    }

    /// Current reference count of a layer.
    pub fn refcount(&self, id: &LayerId) -> Result<u64> {
        Ok(self.read_refs()?.get(&id.to_string()).copied().unwrap_or(0))
    }

    /// Add one reference. Returns the new count.
    pub fn incref(&self, id: &LayerId) -> Result<u64> {
        self.update_refs(|refs| {
            let count = refs.entry(id.to_string()).or_insert(0);
            *count += 1;
            Ok((*count, true))
        })
    }

    /// Drop one reference. Returns the remaining count.
    pub fn decref(&self, id: &LayerId) -> Result<u64> {
        self.update_refs(|refs| {
            let key = id.to_string();
            let Some(count) = refs.get_mut(&key) else {
                return Ok((0, false));
            };
            *count = count.saturating_sub(1);
            let remaining = *count;
            if remaining == 0 {
                refs.remove(&key);
            }
            Ok((remaining, true))
        })
    }

    /// Delete every stored layer without references. Returns the removed ids.
    ///
    /// Nothing is collected while a lease is held; the layers stay until a
    /// later collection.
    pub fn gc(&self) -> Result<Vec<LayerId>> {
        let Some(_gc) = FileLock::try_exclusive(&self.dir.join(GC_LOCK))? else {
            tracing::debug!("Layer collection deferred: image assembly in progress");
            return Ok(Vec::new());
        };
        let refs = self.read_refs()?;

        let mut removed = Vec::new();
        for id in self.stored_ids()? {
            if refs.get(&id.to_string()).is_some_and(|count| *count > 0) {
                continue;
            }
            match std::fs::remove_file(self.blob_path(&id)) {
                Ok(()) => {
                    tracing::debug!(layer = %id, "Removed unreferenced layer");
                    removed.push(id);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// All stored layers with size and reference count.
    pub fn list(&self) -> Result<Vec<LayerMeta>> {
        let refs = self.read_refs()?;
        let mut metas = Vec::new();
        for id in self.stored_ids()? {
            let size = self.size(&id).unwrap_or(0);
            let refs = refs.get(&id.to_string()).copied().unwrap_or(0);
            metas.push(LayerMeta { id, size, refs });
        }
        metas.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(metas)
    }

    fn stored_ids(&self) -> Result<Vec<LayerId>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(self.dir.join("sha256"))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip in-flight temp files.
            if name.starts_with('.') {
                continue;
            }
            if let Ok(id) = Digest::parse(&format!("sha256:{}", name)) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn read_refs(&self) -> Result<RefTable> {
        Ok(read_json(&self.dir.join(REFS_FILE))?.unwrap_or_default())
    }

    fn update_refs<R>(&self, f: impl FnOnce(&mut RefTable) -> Result<(R, bool)>) -> Result<R> {
        update_json(&self.dir.join(REFS_FILE), &self.dir.join(REFS_LOCK), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::diff::Node;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_layer() -> Vec<u8> {
        let mut after = Snapshot::new();
        after.write_file("etc/motd", "welcome", 0o644).unwrap();
        Snapshot::new().diff(&after).to_tar().unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).unwrap();
        let content = sample_layer();

        let id = store.put(&content).unwrap();
        assert_eq!(id, Digest::of(&content));
        assert_eq!(store.get(&id).unwrap(), content);
        assert!(store.contains(&id));
        assert_eq!(store.size(&id).unwrap(), content.len() as u64);
    }

    #[test]
    fn test_put_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).unwrap();
        let content = sample_layer();

        let a = store.put(&content).unwrap();
        let b = store.put(&content).unwrap();
        assert_eq!(a, b);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_identical_puts() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LayerStore::open(tmp.path()).unwrap());
        let content = Arc::new(sample_layer());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let content = content.clone();
                std::thread::spawn(move || store.put(&content).unwrap())
            })
            .collect();
        let ids: Vec<LayerId> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.get(&ids[0]).unwrap(), *content);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).unwrap();
        let err = store.get(&Digest::of(b"absent")).unwrap_err();
        assert!(matches!(err, DocklingError::NotFound { kind: "layer", .. }));
    }

    #[test]
    fn test_refcounts_persist_and_gc() {
        let tmp = TempDir::new().unwrap();
        let kept;
        let dropped;
        {
            let store = LayerStore::open(tmp.path()).unwrap();
            kept = store.put(&sample_layer()).unwrap();
            dropped = store.put(b"not a real layer").unwrap();
            assert_eq!(store.incref(&kept).unwrap(), 1);
            assert_eq!(store.incref(&kept).unwrap(), 2);
            assert_eq!(store.decref(&kept).unwrap(), 1);
        }

        let store = LayerStore::open(tmp.path()).unwrap();
        assert_eq!(store.refcount(&kept).unwrap(), 1);
        assert_eq!(store.gc().unwrap(), vec![dropped.clone()]);
        assert!(store.contains(&kept));
        assert!(!store.contains(&dropped));

        assert_eq!(store.decref(&kept).unwrap(), 0);
        assert_eq!(store.gc().unwrap(), vec![kept]);
    }

    #[test]
    fn test_decref_never_underflows() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).unwrap();
        let id = store.put(&sample_layer()).unwrap();
        assert_eq!(store.decref(&id).unwrap(), 0);
        assert_eq!(store.refcount(&id).unwrap(), 0);
    }

    #[test]
    fn test_refcounts_shared_between_handles() {
        let tmp = TempDir::new().unwrap();
        let a = LayerStore::open(tmp.path()).unwrap();
        let b = LayerStore::open(tmp.path()).unwrap();
        let first = a.put(&sample_layer()).unwrap();
        let second = b.put(b"second layer").unwrap();

        a.incref(&first).unwrap();
        b.incref(&second).unwrap();

        let reopened = LayerStore::open(tmp.path()).unwrap();
        assert_eq!(reopened.refcount(&first).unwrap(), 1);
        assert_eq!(reopened.refcount(&second).unwrap(), 1);
        assert!(reopened.gc().unwrap().is_empty());
        assert!(reopened.contains(&first));
    }

    #[test]
    fn test_concurrent_incref_decref_is_exact() {
        let tmp = TempDir::new().unwrap();
        let id = LayerStore::open(tmp.path())
            .unwrap()
            .put(&sample_layer())
            .unwrap();
        // A baseline reference that must survive the churn.
        LayerStore::open(tmp.path()).unwrap().incref(&id).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = tmp.path().to_path_buf();
                let id = id.clone();
                std::thread::spawn(move || {
                    let store = LayerStore::open(&dir).unwrap();
                    for _ in 0..20 {
                        store.incref(&id).unwrap();
                        store.decref(&id).unwrap();
                    }
                    store.incref(&id).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let store = LayerStore::open(tmp.path()).unwrap();
        assert_eq!(store.refcount(&id).unwrap(), 9);
        assert!(store.gc().unwrap().is_empty());
    }

    #[test]
    fn test_lease_defers_collection() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).unwrap();

        let lease = store.lease().unwrap();
        let pending = store.put(&sample_layer()).unwrap();
        // Another handle (another CLI process) collecting meanwhile.
        let other = LayerStore::open(tmp.path()).unwrap();
        assert!(other.gc().unwrap().is_empty());
        assert!(store.contains(&pending));

        store.incref(&pending).unwrap();
        drop(lease);
        assert!(other.gc().unwrap().is_empty());
        assert!(store.contains(&pending));
    }

    #[test]
    fn test_reconstruct_applies_stack_in_order() {
        let tmp = TempDir::new().unwrap();
        let store = LayerStore::open(tmp.path()).unwrap();

        let mut first = Snapshot::new();
        first.write_file("app/config", "v1", 0o644).unwrap();
        first.write_file("app/old", "gone soon", 0o644).unwrap();
        let bottom = store.put_changes(&Snapshot::new().diff(&first)).unwrap();

        let mut second = first.clone();
        second.write_file("app/config", "v2", 0o644).unwrap();
        second.remove("app/old");
        let top = store.put_changes(&first.diff(&second)).unwrap();

        let rebuilt = store.reconstruct(&[bottom, top]).unwrap();
        assert_eq!(rebuilt, second);
        assert_eq!(rebuilt.get("app/config"), Some(&Node::file("v2", 0o644)));
    }
}
