//! Filesystem helpers shared by the stores.

use std::fs::{File, OpenOptions};
use std::path::Path;

use dockling_core::error::{DocklingError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write `data` to `path` atomically (write a uniquely named sibling, then rename).
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        DocklingError::Other(format!("Path has no parent directory: {}", path.display()))
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    std::fs::write(&tmp_path, data).map_err(|e| {
        DocklingError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to write {}: {}", tmp_path.display(), e),
        ))
    })?;
    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(DocklingError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to rename into {}: {}", path.display(), e),
        )));
    }
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &data)
}

/// Read a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(data) => Ok(Some(serde_json::from_slice(&data).map_err(|e| {
            DocklingError::SerializationError(format!("{}: {}", path.display(), e))
        })?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Advisory `flock` on a lock file, released on drop.
///
/// Locks belong to the open file description, so two handles in the same
/// process exclude each other just like two processes do.
pub struct FileLock {
    _lock: Flock<File>,
}

impl FileLock {
    /// Block until an exclusive lock is held.
    pub fn exclusive(path: &Path) -> Result<Self> {
        Self::acquire(path, FlockArg::LockExclusive)?
            .ok_or_else(|| DocklingError::Other(format!("Lock {} unavailable", path.display())))
    }

    /// Block until a shared lock is held.
    pub fn shared(path: &Path) -> Result<Self> {
        Self::acquire(path, FlockArg::LockShared)?
            .ok_or_else(|| DocklingError::Other(format!("Lock {} unavailable", path.display())))
    }

    /// Exclusive lock if nobody holds the file locked, `None` otherwise.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>> {
        Self::acquire(path, FlockArg::LockExclusiveNonblock)
    }

    fn acquire(path: &Path, arg: FlockArg) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match Flock::lock(file, arg) {
            Ok(lock) => Ok(Some(Self { _lock: lock })),
            Err((_, Errno::EAGAIN)) => Ok(None),
            Err((_, errno)) => Err(std::io::Error::from(errno).into()),
        }
    }
}

/// Read-modify-write a JSON document under an exclusive lock on `lock_path`.
///
/// `f` sees the current on-disk state (default when absent) and returns its
/// result plus whether the document changed; changes are written atomically
/// before the lock is released.
pub fn update_json<T, R>(
    path: &Path,
    lock_path: &Path,
    f: impl FnOnce(&mut T) -> Result<(R, bool)>,
) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default,
{
    let _lock = FileLock::exclusive(lock_path)?;
    let mut doc: T = read_json(path)?.unwrap_or_default();
    let (value, dirty) = f(&mut doc)?;
    if dirty {
        write_json(path, &doc)?;
    }
    Ok(value)
}

/// Run filesystem-heavy work on the blocking thread pool.
pub async fn blocking<T, F>(what: &str, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DocklingError::Other(format!("{} task failed: {}", what, e)))?
}

/// Calculate the total size of a directory recursively.
pub fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            if meta.is_dir() {
                total += dir_size(&entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    total
}
