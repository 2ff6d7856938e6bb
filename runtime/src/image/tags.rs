//! Tag mapping: normalized reference → image id, updated by compare-and-swap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dockling_core::error::{DocklingError, Result};
use parking_lot::Mutex;

use crate::digest::ImageId;
use crate::fs::update_json;

/// Mutable tag → image mapping.
pub trait TagStore: Send + Sync {
    /// Image currently tagged `tag`.
    fn get(&self, tag: &str) -> Result<Option<ImageId>>;

    /// Point `tag` at `new` only if it currently points at `expected`
    /// (`None` = untagged). Fails with `TagConflict` otherwise.
    fn compare_and_swap(&self, tag: &str, expected: Option<&ImageId>, new: &ImageId) -> Result<()>;

    /// Remove a tag, returning the image it pointed at.
    fn remove(&self, tag: &str) -> Result<Option<ImageId>>;

    /// All tags.
    fn list(&self) -> Result<BTreeMap<String, ImageId>>;

    /// Point `tag` at `id` regardless of its current target, retrying the
    /// CAS on concurrent updates. Returns the previous target.
    fn set(&self, tag: &str, id: &ImageId) -> Result<Option<ImageId>> {
        loop {
            let current = self.get(tag)?;
            match self.compare_and_swap(tag, current.as_ref(), id) {
                Ok(()) => return Ok(current),
                Err(DocklingError::TagConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Tags pointing at `id`, sorted.
    fn tags_for(&self, id: &ImageId) -> Result<Vec<String>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|(_, target)| target == id)
            .map(|(tag, _)| tag)
            .collect())
    }
}

fn check_expected(
    tags: &BTreeMap<String, ImageId>,
    tag: &str,
    expected: Option<&ImageId>,
) -> Result<()> {
    if tags.get(tag) == expected {
        Ok(())
    } else {
        Err(DocklingError::TagConflict {
            tag: tag.to_string(),
        })
    }
}

/// In-process tag store.
#[derive(Default)]
pub struct MemoryTagStore {
    tags: Mutex<BTreeMap<String, ImageId>>,
}

impl MemoryTagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagStore for MemoryTagStore {
    fn get(&self, tag: &str) -> Result<Option<ImageId>> {
        Ok(self.tags.lock().get(tag).cloned())
    }

    fn compare_and_swap(&self, tag: &str, expected: Option<&ImageId>, new: &ImageId) -> Result<()> {
        let mut tags = self.tags.lock();
        check_expected(&tags, tag, expected)?;
        tags.insert(tag.to_string(), new.clone());
        Ok(())
    }

    fn remove(&self, tag: &str) -> Result<Option<ImageId>> {
        Ok(self.tags.lock().remove(tag))
    }

    fn list(&self) -> Result<BTreeMap<String, ImageId>> {
        Ok(self.tags.lock().clone())
    }
}

/// Tag store persisted as a JSON file.
///
/// Every operation re-reads the file under an advisory `flock` on a
/// sibling lock file, so concurrent CLI invocations observe each other's
/// updates. Writes go through an atomic rename.
pub struct FileTagStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileTagStore {
    /// Open the tag file at `path` (created on first write).
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
        })
    }

    fn with_tags<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, ImageId>) -> Result<(T, bool)>,
    ) -> Result<T> {
        update_json(&self.path, &self.lock_path, f)
    }
}

impl TagStore for FileTagStore {
    fn get(&self, tag: &str) -> Result<Option<ImageId>> {
        self.with_tags(|tags| Ok((tags.get(tag).cloned(), false)))
    }

    fn compare_and_swap(&self, tag: &str, expected: Option<&ImageId>, new: &ImageId) -> Result<()> {
        self.with_tags(|tags| {
            check_expected(tags, tag, expected)?;
            tags.insert(tag.to_string(), new.clone());
            Ok(((), true))
        })
    }

    fn remove(&self, tag: &str) -> Result<Option<ImageId>> {
        self.with_tags(|tags| {
            let removed = tags.remove(tag);
            let dirty = removed.is_some();
            Ok((removed, dirty))
        })
    }

    fn list(&self) -> Result<BTreeMap<String, ImageId>> {
        self.with_tags(|tags| Ok((tags.clone(), false)))
    }
}
