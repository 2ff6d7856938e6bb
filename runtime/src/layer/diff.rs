//! Pure filesystem snapshots and the change sets between them.
//!
//! A [`Snapshot`] is an in-memory file tree keyed by normalized relative
//! path (`usr/bin/env`, no leading slash). Diffing two snapshots yields a
//! [`ChangeSet`], which is what a layer stores. Change sets serialize to a
//! deterministic tar stream: entries sorted by path, zeroed timestamps and
//! ownership, deletions encoded as OCI whiteouts (`.wh.<name>`).
//!
//! Only [`Snapshot::capture`] and [`Snapshot::materialize`] touch the real
//! filesystem; everything else is pure.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use dockling_core::error::{DocklingError, Result};
use sha2::{Digest, Sha256};

/// Prefix marking a deleted path inside a layer archive.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding every lower-layer entry of its directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const DEFAULT_DIR_MODE: u32 = 0o755;

/// A single filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir { mode: u32 },
    File { mode: u32, content: Arc<[u8]> },
    Symlink { target: String },
}

impl Node {
    /// Regular file node.
    pub fn file(content: impl Into<Vec<u8>>, mode: u32) -> Self {
        Node::File {
            mode,
            content: Arc::from(content.into()),
        }
    }

    /// Directory node.
    pub fn dir(mode: u32) -> Self {
        Node::Dir { mode }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir { .. })
    }

    fn size(&self) -> u64 {
        match self {
            Node::File { content, .. } => content.len() as u64,
            _ => 0,
        }
    }
}

/// Immutable view of a root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, Node>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry. `path` may be absolute or relative.
    pub fn get(&self, path: &str) -> Option<&Node> {
        self.entries.get(&normalize(path))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.entries.iter()
    }

    /// Total size of regular file contents.
    pub fn content_size(&self) -> u64 {
        self.entries.values().map(Node::size).sum()
    }

    /// Insert or replace an entry, creating missing parent directories.
    ///
    /// Replacing a directory with a non-directory drops its descendants.
    pub fn insert(&mut self, path: &str, node: Node) -> Result<()> {
        let path = normalize(path);
        if path.is_empty() {
            if node.is_dir() {
                return Ok(());
            }
            return Err(DocklingError::Other(
                "Cannot replace the root directory with a non-directory".to_string(),
            ));
        }

        if let Some((parent, _)) = path.rsplit_once('/') {
            self.mkdir_all(parent)?;
        }
        if !node.is_dir() {
            self.remove_descendants(&path);
        }
        self.entries.insert(path, node);
        Ok(())
    }

    /// Write a regular file.
    pub fn write_file(&mut self, path: &str, content: impl Into<Vec<u8>>, mode: u32) -> Result<()> {
        self.insert(path, Node::file(content, mode))
    }

    /// Create a directory and all of its missing parents.
    pub fn mkdir_all(&mut self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(component);
            match self.entries.get(&current) {
                Some(Node::Dir { .. }) => {}
                Some(_) => {
                    return Err(DocklingError::Other(format!(
                        "Cannot create directory /{}: a non-directory exists at /{}",
                        path, current
                    )))
                }
                None => {
                    self.entries
                        .insert(current.clone(), Node::dir(DEFAULT_DIR_MODE));
                }
            }
        }
        Ok(())
    }

    /// Remove an entry and everything below it. Returns whether anything was removed.
    pub fn remove(&mut self, path: &str) -> bool {
        let path = normalize(path);
        let removed_descendants = self.remove_descendants(&path);
        self.entries.remove(&path).is_some() || removed_descendants
    }

    /// Paths strictly below `dir`, in sorted order.
    pub fn descendants<'a>(&'a self, dir: &str) -> impl Iterator<Item = (&'a String, &'a Node)> + 'a {
        let dir = normalize(dir);
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{}/", dir)
        };
        self.entries
            .range(prefix.clone()..)
            .take_while(move |(k, _)| k.starts_with(&prefix))
    }

    fn remove_descendants(&mut self, path: &str) -> bool {
        let doomed: Vec<String> = self.descendants(path).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            self.entries.remove(key);
        }
        !doomed.is_empty()
    }

    /// Changes that turn `self` into `after`.
    pub fn diff(&self, after: &Snapshot) -> ChangeSet {
        let mut changes = ChangeSet::default();

        for (path, node) in &after.entries {
            if self.entries.get(path) != Some(node) {
                changes.upserts.insert(path.clone(), node.clone());
            }
        }

        for path in self.entries.keys() {
            if after.entries.contains_key(path) {
                continue;
            }
            // A removed or replaced ancestor already covers this path.
            let covered = ancestors(path).any(|a| {
                changes.deletions.contains(a)
                    || after.entries.get(a).is_some_and(|n| !n.is_dir())
            });
            if !covered {
                changes.deletions.insert(path.clone());
            }
        }

        changes
    }

    /// Apply a change set in place.
    pub fn apply(&mut self, changes: &ChangeSet) -> Result<()> {
        for dir in &changes.opaque_dirs {
            self.remove_descendants(dir);
        }
        for path in &changes.deletions {
            self.remove(path);
        }
        for (path, node) in &changes.upserts {
            self.insert(path, node.clone())?;
        }
        Ok(())
    }

    /// Stable digest of `path` and everything below it (empty tree if absent).
    pub fn digest_under(&self, path: &str) -> String {
        let path = normalize(path);
        let mut hasher = Sha256::new();
        let own = self.entries.get_key_value(&path);
        for (key, node) in own.into_iter().chain(self.descendants(&path)) {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            match node {
                Node::Dir { mode } => hasher.update(format!("d{:o}", mode).as_bytes()),
                Node::File { mode, content } => {
                    hasher.update(format!("f{:o}:{}:", mode, content.len()).as_bytes());
                    hasher.update(content);
                }
                Node::Symlink { target } => hasher.update(format!("l{}", target).as_bytes()),
            }
            hasher.update([b'\n']);
        }
        hex::encode(hasher.finalize())
    }

    /// Read a directory tree from disk.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut snapshot = Snapshot::new();
        capture_dir(root, root, &mut snapshot.entries)?;
        Ok(snapshot)
    }

    /// Write the snapshot into `root`, overwriting entries that already exist.
    pub fn materialize(&self, root: &Path) -> Result<()> {
        std::fs::create_dir_all(root)?;
        let mut dirs = Vec::new();

        for (path, node) in &self.entries {
            let full = root.join(path);
            match node {
                Node::Dir { mode } => {
                    if full.symlink_metadata().is_ok_and(|m| !m.is_dir()) {
                        std::fs::remove_file(&full)?;
                    }
                    std::fs::create_dir_all(&full)?;
                    dirs.push((full, *mode));
                }
                Node::File { mode, content } => {
                    remove_existing(&full)?;
                    std::fs::write(&full, content).map_err(|e| {
                        DocklingError::IoError(std::io::Error::new(
                            e.kind(),
                            format!("Failed to write {}: {}", full.display(), e),
                        ))
                    })?;
                    std::fs::set_permissions(&full, std::fs::Permissions::from_mode(*mode))?;
                }
                Node::Symlink { target } => {
                    remove_existing(&full)?;
                    std::os::unix::fs::symlink(target, &full)?;
                }
            }
        }

        // Directory modes last so read-only directories can still be populated.
        for (dir, mode) in dirs.into_iter().rev() {
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode | 0o700))?;
        }
        Ok(())
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

fn capture_dir(root: &Path, current: &Path, entries: &mut BTreeMap<String, Node>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        DocklingError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read directory {}: {}", current.display(), e),
        ))
    })?;

    for entry in read_dir {
        let entry = entry?;
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| DocklingError::Other(format!("Failed to strip prefix: {}", e)))?;
        let key = normalize(&relative.to_string_lossy());
        let meta = path.symlink_metadata()?;
        let mode = meta.permissions().mode() & 0o7777;

        if meta.file_type().is_symlink() {
            let target = std::fs::read_link(&path)?;
            entries.insert(
                key,
                Node::Symlink {
                    target: target.to_string_lossy().to_string(),
                },
            );
        } else if meta.is_dir() {
            entries.insert(key, Node::dir(mode));
            capture_dir(root, &path, entries)?;
        } else if meta.is_file() {
            let content = std::fs::read(&path)?;
            entries.insert(key, Node::file(content, mode));
        } else {
            tracing::debug!(path = %path.display(), "Skipping special file");
        }
    }
    Ok(())
}

/// Filesystem changes carried by one layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Entries added or modified
    pub upserts: BTreeMap<String, Node>,
    /// Entries removed (descendants implied)
    pub deletions: BTreeSet<String>,
    /// Directories whose lower-layer contents are hidden
    pub opaque_dirs: BTreeSet<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty() && self.opaque_dirs.is_empty()
    }

    /// Serialize as a deterministic, uncompressed tar archive.
    pub fn to_tar(&self) -> Result<Vec<u8>> {
        enum Item<'a> {
            Node(&'a Node),
            Whiteout,
        }

        let mut items: Vec<(String, Item<'_>)> = Vec::new();
        for (path, node) in &self.upserts {
            items.push((path.clone(), Item::Node(node)));
        }
        for path in &self.deletions {
            items.push((whiteout_path(path), Item::Whiteout));
        }
        for dir in &self.opaque_dirs {
            items.push((join(dir, OPAQUE_WHITEOUT), Item::Whiteout));
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));

        let mut builder = tar::Builder::new(Vec::new());
        for (path, item) in items {
            let result = match item {
                Item::Whiteout => {
                    let mut header = base_header(tar::EntryType::Regular, 0o644, 0);
                    builder.append_data(&mut header, &path, std::io::empty())
                }
                Item::Node(Node::Dir { mode }) => {
                    let mut header = base_header(tar::EntryType::Directory, *mode, 0);
                    builder.append_data(&mut header, format!("{}/", path), std::io::empty())
                }
                Item::Node(Node::File { mode, content }) => {
                    let mut header =
                        base_header(tar::EntryType::Regular, *mode, content.len() as u64);
                    builder.append_data(&mut header, &path, &content[..])
                }
                Item::Node(Node::Symlink { target }) => {
                    let mut header = base_header(tar::EntryType::Symlink, 0o777, 0);
                    builder.append_link(&mut header, &path, target)
                }
            };
            result.map_err(|e| {
                DocklingError::Other(format!("Failed to add {} to layer archive: {}", path, e))
            })?;
        }

        builder
            .into_inner()
            .map_err(|e| DocklingError::Other(format!("Failed to finalize layer archive: {}", e)))
    }

    /// Decode a layer archive (plain or gzip-compressed tar).
    pub fn from_tar(data: &[u8]) -> Result<Self> {
        let reader: Box<dyn Read + '_> = if is_gzip(data) {
            Box::new(flate2::read::GzDecoder::new(data))
        } else {
            Box::new(data)
        };

        let mut archive = tar::Archive::new(reader);
        let mut changes = ChangeSet::default();
        let entries = archive
            .entries()
            .map_err(|e| DocklingError::Other(format!("Invalid layer archive: {}", e)))?;

        for entry in entries {
            let mut entry =
                entry.map_err(|e| DocklingError::Other(format!("Invalid layer entry: {}", e)))?;
            let raw_path = entry
                .path()
                .map_err(|e| DocklingError::Other(format!("Invalid layer path: {}", e)))?
                .to_string_lossy()
                .to_string();
            let path = normalize(&raw_path);
            if path.is_empty() {
                continue;
            }

            let (parent, name) = match path.rsplit_once('/') {
                Some((p, n)) => (p.to_string(), n.to_string()),
                None => (String::new(), path.clone()),
            };

            if name == OPAQUE_WHITEOUT {
                changes.opaque_dirs.insert(parent);
                continue;
            }
            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                changes.deletions.insert(join(&parent, hidden));
                continue;
            }

            let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;
            let node = match entry.header().entry_type() {
                tar::EntryType::Directory => Node::dir(mode),
                tar::EntryType::Regular | tar::EntryType::Continuous => {
                    let mut content = Vec::new();
                    entry.read_to_end(&mut content)?;
                    Node::file(content, mode)
                }
                tar::EntryType::Symlink => {
                    let target = entry
                        .link_name()
                        .map_err(|e| DocklingError::Other(format!("Invalid symlink: {}", e)))?
                        .map(|t| t.to_string_lossy().to_string())
                        .unwrap_or_default();
                    Node::Symlink { target }
                }
                tar::EntryType::Link => {
                    let target = entry
                        .link_name()
                        .ok()
                        .flatten()
                        .map(|t| normalize(&t.to_string_lossy()));
                    match target.and_then(|t| changes.upserts.get(&t).cloned()) {
                        Some(node) => node,
                        None => {
                            tracing::warn!(path = %path, "Hard link target not in layer, skipping");
                            continue;
                        }
                    }
                }
                other => {
                    tracing::debug!(path = %path, entry_type = ?other, "Skipping unsupported layer entry");
                    continue;
                }
            };
            changes.upserts.insert(path, node);
        }

        Ok(changes)
    }
}

fn base_header(entry_type: tar::EntryType, mode: u32, size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_mode(mode);
    header.set_size(size);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header
}

/// Whether `data` starts with the gzip magic bytes.
pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

fn whiteout_path(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((parent, name)) => format!("{}/{}{}", parent, WHITEOUT_PREFIX, name),
        None => format!("{}{}", WHITEOUT_PREFIX, path),
    }
}

/// Join a normalized directory and a child name.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        normalize(name)
    } else {
        normalize(&format!("{}/{}", dir, name))
    }
}

/// Strict ancestors of a normalized path, nearest first.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    let mut current = path;
    std::iter::from_fn(move || {
        let (parent, _) = current.rsplit_once('/')?;
        current = parent;
        Some(parent)
    })
}

/// Normalize a path lexically: no leading slash, no `.`/`..`/empty components.
///
/// `..` never escapes the root. The root itself normalizes to `""`.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            c => parts.push(c),
        }
    }
    parts.join("/")
}
