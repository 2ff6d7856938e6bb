//! Build cache: instruction cache key → produced layer.
//!
//! A key chains the parent key with the canonical instruction and its
//! inputs, so changing one instruction changes the key of every later one.
//! The index is persisted as `build-cache.json`; writes re-read it under
//! `build-cache.lock` so concurrent builds on one root merge their records.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dockling_core::error::Result;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::digest::LayerId;
use crate::fs::{read_json, write_json, FileLock};

type Index = HashMap<String, CacheRecord>;

/// Cache record for one executed instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Layer produced, or `None` when the instruction changed nothing
    pub layer: Option<LayerId>,
    /// Canonical instruction text
    pub created_by: String,
    pub created: DateTime<Utc>,
}

/// Persistent cache index.
pub struct BuildCache {
    path: PathBuf,
    lock_path: PathBuf,
    entries: Mutex<Index>,
}

impl BuildCache {
    /// Open the cache index at `path` (created on first record).
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: path.with_extension("lock"),
            entries: Mutex::new(load(path)),
        })
    }

    pub fn lookup(&self, key: &str) -> Option<CacheRecord> {
        self.entries.lock().get(key).cloned()
    }

    /// Record (or overwrite) the result for `key`.
    pub fn record(&self, key: &str, record: CacheRecord) -> Result<()> {
        let merged = self.update(|index| {
            index.insert(key.to_string(), record);
            true
        })?;
        *self.entries.lock() = merged;
        Ok(())
    }

    /// Drop records whose layer `is_stored` rejects. Returns how many went.
    pub fn prune(&self, is_stored: impl Fn(&LayerId) -> bool) -> Result<usize> {
        let mut pruned = 0;
        let merged = self.update(|index| {
            let before = index.len();
            index.retain(|_, record| record.layer.as_ref().map_or(true, &is_stored));
            pruned = before - index.len();
            pruned > 0
        })?;
        *self.entries.lock() = merged;
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned build cache records");
        }
        Ok(pruned)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Apply `f` to the on-disk index and return the merged result.
    fn update(&self, f: impl FnOnce(&mut Index) -> bool) -> Result<Index> {
        let _lock = FileLock::exclusive(&self.lock_path)?;
        let mut index = load(&self.path);
        if f(&mut index) {
            write_json(&self.path, &index)?;
        }
        Ok(index)
    }
}

fn load(path: &Path) -> Index {
    match read_json(path) {
        Ok(entries) => entries.unwrap_or_default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable build cache");
            Index::new()
        }
    }
}

/// Key for a stage rooted at `base` (an image id or `scratch`).
pub fn base_key(base: &str) -> String {
    chain_key("", &format!("FROM {}", base), "")
}

/// `sha256(parent ‖ instruction ‖ inputs)`.
pub fn chain_key(parent: &str, instruction: &str, inputs: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent.as_bytes());
    hasher.update([0u8]);
    hasher.update(instruction.as_bytes());
    hasher.update([0u8]);
    hasher.update(inputs.as_bytes());
    hex::encode(hasher.finalize())
}
