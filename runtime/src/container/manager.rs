//! Container lifecycle management.
//!
//! Every container has its own `tokio::sync::Mutex`; operations on different
//! containers never contend. Listing reads a separately locked snapshot of
//! each record so it never waits behind a slow `stop`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use dockling_core::error::{DocklingError, Result};
use dockling_core::event::{events, EngineEvent, EventEmitter};
use dockling_core::IsolationMode;
use nix::sys::signal::Signal;
use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use super::process::{ExecOutput, ProcessHandle, ProcessLauncher, ProcessSpec};
use super::record::{
    generate_name, validate_name, ContainerConfig, ContainerFilter, ContainerPaths,
    ContainerRecord, ContainerSummary,
};
use super::state::ContainerState;
use crate::digest::ImageId;
use crate::fs::{blocking, read_json, write_json};
use crate::image::{HistoryEntry, Image, ImageConfig, ImageReference, ImageStore};
use crate::layer::Snapshot;

/// Bounded wait after SIGKILL before a container is declared stopped.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Exit code recorded when a killed process never reports back.
const KILLED_EXIT_CODE: i32 = 128 + Signal::SIGKILL as i32;

struct Entry {
    record: ContainerRecord,
    process: Option<Arc<dyn ProcessHandle>>,
    /// Bumped on every start; a monitor only acts on its own run.
    generation: u64,
}

struct ContainerSlot {
    entry: Mutex<Entry>,
    snapshot: RwLock<ContainerRecord>,
    paths: ContainerPaths,
}

struct Inner {
    dir: PathBuf,
    images: Arc<ImageStore>,
    launcher: Arc<dyn ProcessLauncher>,
    isolation: IsolationMode,
    kill_grace: Duration,
    slots: DashMap<String, Arc<ContainerSlot>>,
    /// name -> id
    names: DashMap<String, String>,
    events: EventEmitter,
}

/// Creates, runs, stops and removes containers.
#[derive(Clone)]
pub struct ContainerManager {
    inner: Arc<Inner>,
}

impl ContainerManager {
    /// Manager over the container records under `dir`. Call [`load`](Self::load)
    /// before use.
    pub fn new(
        dir: &Path,
        images: Arc<ImageStore>,
        launcher: Arc<dyn ProcessLauncher>,
        isolation: IsolationMode,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: dir.to_path_buf(),
                images,
                launcher,
                isolation,
                kill_grace: KILL_GRACE,
                slots: DashMap::new(),
                names: DashMap::new(),
                events: EventEmitter::default(),
            }),
        }
    }

    /// Override the post-SIGKILL grace period. Only effective before `load`.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.kill_grace = grace;
        }
        self
    }

    /// Use a shared event emitter. Only effective before `load`.
    pub fn with_events(mut self, events: EventEmitter) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = events;
        }
        self
    }

    pub fn events(&self) -> &EventEmitter {
        &self.inner.events
    }

    /// Load all container records.
    ///
    /// Records left `Running` by an earlier process are re-attached when
    /// their PID is still alive and reconciled to `Stopped` otherwise.
    pub async fn load(&self) -> Result<()> {
        std::fs::create_dir_all(&self.inner.dir)?;
        for dir_entry in std::fs::read_dir(&self.inner.dir)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let id = dir_entry.file_name().to_string_lossy().to_string();
            let paths = ContainerPaths::new(&self.inner.dir, &id);

            let mut record: ContainerRecord = match read_json(&paths.record()) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::warn!(container = %id, "Removing container directory without a record");
                    let _ = std::fs::remove_dir_all(&paths.dir);
                    continue;
                }
                Err(e) => {
                    tracing::warn!(container = %id, error = %e, "Skipping unreadable container record");
                    continue;
                }
            };

            if record.state == ContainerState::Removed {
                let _ = std::fs::remove_dir_all(&paths.dir);
                continue;
            }

            let mut process = None;
            if record.state == ContainerState::Running {
                process = record.pid.and_then(|pid| self.inner.launcher.attach(pid));
                if process.is_none() {
                    tracing::info!(container = %record.name, pid = ?record.pid, "Reconciling dead container to stopped");
                    record.state = ContainerState::Stopped;
                    record.pid = None;
                    record.finished_at = Some(Utc::now());
                    write_json(&paths.record(), &record)?;
                }
            }

            self.inner.names.insert(record.name.clone(), record.id.clone());
            let slot = Arc::new(ContainerSlot {
                snapshot: RwLock::new(record.clone()),
                entry: Mutex::new(Entry {
                    record,
                    process: process.clone(),
                    generation: 1,
                }),
                paths,
            });
            self.inner.slots.insert(id, slot.clone());
            if let Some(process) = process {
                self.spawn_monitor(slot, 1, process);
            }
        }
        tracing::debug!(containers = self.inner.slots.len(), "Loaded container records");
        Ok(())
    }

    // --- resolution -------------------------------------------------------

    /// Resolve a name, full id, or unique id prefix to a container id.
    pub fn resolve(&self, query: &str) -> Result<String> {
        if let Some(id) = self.inner.names.get(query) {
            return Ok(id.value().clone());
        }
        if self.inner.slots.contains_key(query) {
            return Ok(query.to_string());
        }
        if !query.is_empty() {
            let matches: Vec<String> = self
                .inner
                .slots
                .iter()
                .filter(|s| s.key().starts_with(query))
                .map(|s| s.key().clone())
                .collect();
            match matches.len() {
                0 => {}
                1 => return Ok(matches[0].clone()),
                count => {
                    return Err(DocklingError::Ambiguous {
                        kind: "container",
                        query: query.to_string(),
                        count,
                    })
                }
            }
        }
        Err(DocklingError::not_found("container", query))
    }

    fn slot(&self, query: &str) -> Result<Arc<ContainerSlot>> {
        let id = self.resolve(query)?;
        self.inner
            .slots
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| DocklingError::not_found("container", query))
    }

    /// Lock a container, failing if it was removed while waiting.
    async fn lock<'a>(
        &self,
        slot: &'a ContainerSlot,
        query: &str,
    ) -> Result<MutexGuard<'a, Entry>> {
        let entry = slot.entry.lock().await;
        if entry.record.state == ContainerState::Removed {
            return Err(DocklingError::not_found("container", query));
        }
        Ok(entry)
    }

    fn persist(&self, slot: &ContainerSlot, entry: &Entry) -> Result<()> {
        write_json(&slot.paths.record(), &entry.record)?;
        slot.snapshot.write().clone_from(&entry.record);
        Ok(())
    }

    fn emit(&self, key: &str, record: &ContainerRecord) {
        self.inner.events.emit(
            EngineEvent::new(key, record.id.clone())
                .with("name", &record.name)
                .with("image", &record.image_ref),
        );
    }

    // --- lifecycle --------------------------------------------------------

    /// Create a container from an image. The image's rootfs is materialized
    /// as the container's writable filesystem.
    pub async fn create(
        &self,
        image_query: &str,
        overrides: &ContainerConfig,
        name: Option<&str>,
    ) -> Result<ContainerRecord> {
        let image = self.inner.images.resolve(image_query)?;
        let config = overrides.resolve(&image.config);
        if config.argv().is_empty() {
            return Err(DocklingError::Other(format!(
                "no command specified and image {} has no entrypoint or cmd",
                image_query
            )));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let name = self.reserve_name(name, &id)?;
        let paths = ContainerPaths::new(&self.inner.dir, &id);

        let record = ContainerRecord {
            short_id: ContainerRecord::make_short_id(&id),
            id: id.clone(),
            name: name.clone(),
            image_id: image.id.clone(),
            image_ref: image_query.to_string(),
            config,
            state: ContainerState::Created,
            pid: None,
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            restart_count: 0,
        };

        if let Err(e) = self.prepare(&paths, &image, &record).await {
            self.inner.names.remove(&name);
            let _ = std::fs::remove_dir_all(&paths.dir);
            return Err(e);
        }

        self.inner.slots.insert(
            id.clone(),
            Arc::new(ContainerSlot {
                snapshot: RwLock::new(record.clone()),
                entry: Mutex::new(Entry {
                    record: record.clone(),
                    process: None,
                    generation: 0,
                }),
                paths,
            }),
        );

        tracing::info!(container = %record.short_id, name = %name, image = %image.id.short(), "Created container");
        self.emit(events::CONTAINER_CREATE, &record);
        Ok(record)
    }

    async fn prepare(
        &self,
        paths: &ContainerPaths,
        image: &Image,
        record: &ContainerRecord,
    ) -> Result<()> {
        let store = self.inner.images.layers().clone();
        let layers = image.layers.clone();
        let (dir, root) = (paths.dir.clone(), paths.rootfs());
        blocking("materialize", move || {
            std::fs::create_dir_all(&dir)?;
            store.reconstruct(&layers)?.materialize(&root)
        })
        .await?;
        write_json(&paths.record(), record)
    }

    fn reserve_name(&self, requested: Option<&str>, id: &str) -> Result<String> {
        if let Some(name) = requested {
            validate_name(name)?;
            return match self.inner.names.entry(name.to_string()) {
                MapEntry::Occupied(_) => Err(DocklingError::NameConflict(name.to_string())),
                MapEntry::Vacant(slot) => {
                    slot.insert(id.to_string());
                    Ok(name.to_string())
                }
            };
        }

        let mut attempt = 0u32;
        loop {
            let candidate = match attempt {
                0..=7 => generate_name(),
                n => format!("{}{}", generate_name(), n),
            };
            if let MapEntry::Vacant(slot) = self.inner.names.entry(candidate.clone()) {
                slot.insert(id.to_string());
                return Ok(candidate);
            }
            attempt += 1;
        }
    }

    /// Start a created or stopped container.
    pub async fn start(&self, query: &str) -> Result<ContainerRecord> {
        let slot = self.slot(query)?;
        let mut entry = self.lock(&slot, query).await?;
        self.start_locked(&slot, &mut entry).await?;
        Ok(entry.record.clone())
    }

    async fn start_locked(&self, slot: &Arc<ContainerSlot>, entry: &mut Entry) -> Result<()> {
        match entry.record.state {
            ContainerState::Running => {
                return Err(DocklingError::AlreadyRunning(entry.record.name.clone()))
            }
            ContainerState::Removed => {
                return Err(DocklingError::not_found("container", entry.record.id.clone()))
            }
            ContainerState::Created | ContainerState::Stopped => {}
        }

        let config = &entry.record.config;
        let spec = ProcessSpec {
            argv: config.argv(),
            env: config.env.clone(),
            rootfs: slot.paths.rootfs(),
            workdir: config.working_dir.clone().unwrap_or_else(|| "/".to_string()),
            user: config.user.clone(),
            log_path: Some(slot.paths.console_log()),
            isolation: self.inner.isolation,
        };
        let process = self.inner.launcher.launch(&spec).await?;

        entry.generation += 1;
        entry.process = Some(process.clone());
        entry.record.state = ContainerState::Running;
        entry.record.pid = Some(process.pid());
        entry.record.exit_code = None;
        entry.record.started_at = Some(Utc::now());
        entry.record.finished_at = None;
        self.persist(slot, entry)?;

        self.spawn_monitor(slot.clone(), entry.generation, process);
        tracing::info!(container = %entry.record.short_id, pid = ?entry.record.pid, "Started container");
        self.emit(events::CONTAINER_START, &entry.record);
        Ok(())
    }

    /// Watch a run; record the exit when the process ends on its own.
    fn spawn_monitor(&self, slot: Arc<ContainerSlot>, generation: u64, process: Arc<dyn ProcessHandle>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let code = process.wait().await;
            manager.on_exit(&slot, generation, code).await;
        });
    }

    /// Record a self-initiated exit of run `generation`, unless an operation
    /// already handled it.
    async fn on_exit(&self, slot: &ContainerSlot, generation: u64, code: i32) {
        let mut entry = slot.entry.lock().await;
        if entry.generation != generation || entry.record.state != ContainerState::Running {
            return;
        }
        tracing::info!(container = %entry.record.short_id, exit_code = code, "Container exited");
        self.finish(slot, &mut entry, code);

        if entry.record.config.auto_remove {
            let id = entry.record.id.clone();
            drop(entry);
            if let Err(e) = self.remove(&id, false).await {
                tracing::warn!(container = %id, error = %e, "Auto-remove failed");
            }
        }
    }

    fn finish(&self, slot: &ContainerSlot, entry: &mut Entry, code: i32) {
        entry.process = None;
        entry.record.state = ContainerState::Stopped;
        entry.record.pid = None;
        entry.record.exit_code = (code >= 0).then_some(code);
        entry.record.finished_at = Some(Utc::now());
        if let Err(e) = self.persist(slot, entry) {
            tracing::warn!(container = %entry.record.short_id, error = %e, "Failed to persist container record");
        }
        self.inner.events.emit(
            EngineEvent::new(events::CONTAINER_DIE, entry.record.id.clone())
                .with("name", &entry.record.name)
                .with("exitCode", code),
        );
    }

    /// Stop a running container: SIGTERM, then SIGKILL after `timeout`.
    ///
    /// Never blocks longer than `timeout` plus the kill grace period.
    pub async fn stop(&self, query: &str, timeout: Duration) -> Result<ContainerRecord> {
        let slot = self.slot(query)?;
        let mut entry = self.lock(&slot, query).await?;
        self.stop_locked(&slot, &mut entry, timeout).await?;
        let record = entry.record.clone();
        drop(entry);

        if record.config.auto_remove {
            self.remove(&record.id, false).await?;
        }
        Ok(record)
    }

    async fn stop_locked(&self, slot: &ContainerSlot, entry: &mut Entry, timeout: Duration) -> Result<()> {
        if entry.record.state != ContainerState::Running {
            return Err(DocklingError::InvalidState {
                id: entry.record.name.clone(),
                state: entry.record.state.to_string(),
                operation: "stop".to_string(),
            });
        }

        let code = match entry.process.clone() {
            Some(process) => self.terminate(&entry.record, process.as_ref(), timeout).await,
            None => -1,
        };
        self.finish(slot, entry, code);
        tracing::info!(container = %entry.record.short_id, exit_code = code, "Stopped container");
        self.emit(events::CONTAINER_STOP, &entry.record);
        Ok(())
    }

    async fn terminate(&self, record: &ContainerRecord, process: &dyn ProcessHandle, timeout: Duration) -> i32 {
        if let Err(e) = process.signal(Signal::SIGTERM) {
            tracing::warn!(container = %record.short_id, error = %e, "Failed to send SIGTERM");
        }
        if let Ok(code) = tokio::time::timeout(timeout, process.wait()).await {
            return code;
        }
        tracing::warn!(
            container = %record.short_id,
            timeout_secs = timeout.as_secs_f64(),
            "Container did not exit after SIGTERM, sending SIGKILL"
        );
        self.kill(record, process).await
    }

    async fn kill(&self, record: &ContainerRecord, process: &dyn ProcessHandle) -> i32 {
        if let Err(e) = process.signal(Signal::SIGKILL) {
            tracing::warn!(container = %record.short_id, error = %e, "Failed to send SIGKILL");
        }
        match tokio::time::timeout(self.inner.kill_grace, process.wait()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::warn!(container = %record.short_id, pid = process.pid(), "Process still present after SIGKILL");
                KILLED_EXIT_CODE
            }
        }
    }

    /// Stop (if running) and start again.
    pub async fn restart(&self, query: &str, timeout: Duration) -> Result<ContainerRecord> {
        let slot = self.slot(query)?;
        let mut entry = self.lock(&slot, query).await?;
        if entry.record.state == ContainerState::Running {
            self.stop_locked(&slot, &mut entry, timeout).await?;
        }
        self.start_locked(&slot, &mut entry).await?;
        entry.record.restart_count += 1;
        self.persist(&slot, &entry)?;
        Ok(entry.record.clone())
    }

    /// Remove a container and its writable filesystem. Running containers
    /// require `force`, which kills them first. Returns the container id.
    pub async fn remove(&self, query: &str, force: bool) -> Result<String> {
        let slot = self.slot(query)?;
        let mut entry = self.lock(&slot, query).await?;

        if entry.record.state == ContainerState::Running {
            if !force {
                return Err(DocklingError::ContainerRunning(entry.record.name.clone()));
            }
            let code = match entry.process.clone() {
                Some(process) => self.kill(&entry.record, process.as_ref()).await,
                None => KILLED_EXIT_CODE,
            };
            self.finish(&slot, &mut entry, code);
        }

        entry.record.state = ContainerState::Removed;
        // Mark before deleting so a crash mid-removal is cleaned up on load.
        if let Err(e) = write_json(&slot.paths.record(), &entry.record) {
            tracing::debug!(error = %e, "Failed to mark container removed");
        }
        match std::fs::remove_dir_all(&slot.paths.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                entry.record.state = ContainerState::Stopped;
                let _ = self.persist(&slot, &entry);
                return Err(e.into());
            }
        }

        slot.snapshot.write().clone_from(&entry.record);
        self.inner.slots.remove(&entry.record.id);
        self.inner.names.remove(&entry.record.name);
        tracing::info!(container = %entry.record.short_id, name = %entry.record.name, "Removed container");
        self.emit(events::CONTAINER_DESTROY, &entry.record);
        Ok(entry.record.id.clone())
    }

    /// Wait for a running container to exit and return its exit code.
    pub async fn wait(&self, query: &str) -> Result<i32> {
        let slot = self.slot(query)?;
        let (process, generation) = {
            let entry = self.lock(&slot, query).await?;
            match (entry.record.state, entry.process.clone()) {
                (ContainerState::Running, Some(process)) => (process, entry.generation),
                (ContainerState::Running, None) => return Ok(-1),
                (ContainerState::Stopped, _) => return Ok(entry.record.exit_code.unwrap_or(-1)),
                (state, _) => {
                    return Err(DocklingError::InvalidState {
                        id: entry.record.name.clone(),
                        state: state.to_string(),
                        operation: "wait".to_string(),
                    })
                }
            }
        };
        let code = process.wait().await;
        self.on_exit(&slot, generation, code).await;
        Ok(code)
    }

    // --- queries ----------------------------------------------------------

    /// Current record.
    pub fn inspect(&self, query: &str) -> Result<ContainerRecord> {
        Ok(self.slot(query)?.snapshot.read().clone())
    }

    /// Containers passing `filter`, oldest first.
    pub fn list(&self, filter: &ContainerFilter) -> Vec<ContainerSummary> {
        let ancestor = filter
            .ancestor
            .as_deref()
            .and_then(|a| self.inner.images.resolve(a).ok())
            .map(|image| image.id);

        let mut summaries: Vec<ContainerSummary> = self
            .inner
            .slots
            .iter()
            .map(|slot| slot.snapshot.read().clone())
            .filter(|record| filter.matches(record, ancestor.as_ref()))
            .map(|record| ContainerSummary::from(&record))
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Whether any container was created from `image`.
    pub fn uses_image(&self, image: &ImageId) -> bool {
        self.inner
            .slots
            .iter()
            .any(|slot| slot.snapshot.read().image_id == *image)
    }

    /// Console log path, for following output.
    pub fn log_path(&self, query: &str) -> Result<PathBuf> {
        Ok(self.slot(query)?.paths.console_log())
    }

    /// Console output, optionally only the last `tail` lines.
    pub fn logs(&self, query: &str, tail: Option<usize>) -> Result<String> {
        let path = self.log_path(query)?;
        let content = match std::fs::read(&path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(match tail {
            Some(n) => tail_lines(&content, n),
            None => content,
        })
    }

    /// Run an extra command inside a running container.
    pub async fn exec(&self, query: &str, argv: Vec<String>) -> Result<ExecOutput> {
        let slot = self.slot(query)?;
        let record = slot.snapshot.read().clone();
        if record.state != ContainerState::Running {
            return Err(DocklingError::InvalidState {
                id: record.name,
                state: record.state.to_string(),
                operation: "exec".to_string(),
            });
        }
        let spec = ProcessSpec {
            argv,
            env: record.config.env.clone(),
            rootfs: slot.paths.rootfs(),
            workdir: record.config.working_dir.clone().unwrap_or_else(|| "/".to_string()),
            user: record.config.user.clone(),
            log_path: None,
            isolation: self.inner.isolation,
        };
        tracing::debug!(container = %record.short_id, command = ?spec.argv, "Executing in container");
        self.inner.launcher.exec(&spec).await
    }

    /// Snapshot the container's filesystem changes into a new image.
    pub async fn commit(&self, query: &str, reference: Option<&ImageReference>) -> Result<ImageId> {
        let slot = self.slot(query)?;
        let record = slot.snapshot.read().clone();
        let images = &self.inner.images;
        let base = images.get(&record.image_id)?;

        let _lease = images.layers().lease()?;
        let store = images.layers().clone();
        let layers = base.layers.clone();
        let before = blocking("reconstruct", move || store.reconstruct(&layers)).await?;
        let rootfs = slot.paths.rootfs();
        let after = blocking("capture", move || Snapshot::capture(&rootfs)).await?;
        let changes = before.diff(&after);

        let mut layers = base.layers.clone();
        if !changes.is_empty() {
            layers.push(images.layers().put_changes(&changes)?);
        }

        let config = ImageConfig {
            entrypoint: record.config.entrypoint.clone(),
            cmd: record.config.cmd.clone(),
            env: record.config.env.clone(),
            working_dir: record.config.working_dir.clone(),
            user: record.config.user.clone(),
            ..base.config.clone()
        };
        let mut history = base.history.clone();
        history.push(HistoryEntry {
            created_by: format!("dockling commit {}", record.name),
            empty_layer: changes.is_empty(),
            created: Utc::now(),
        });

        let image = Image::new(layers, config, history)?;
        let id = image.id.clone();
        images.insert(image)?;
        if let Some(reference) = reference {
            images.tag(&id, reference)?;
        }

        tracing::info!(container = %record.short_id, image = %id.short(), "Committed container");
        self.inner.events.emit(
            EngineEvent::new(events::CONTAINER_COMMIT, record.id.clone())
                .with("name", &record.name)
                .with("image", id.to_string()),
        );
        Ok(id)
    }
}

fn tail_lines(content: &str, n: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(n);
    let mut out = lines[start..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::process::{HostLauncher, ProcessHandle};
    use crate::image::MemoryTagStore;
    use crate::layer::LayerStore;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;
    use tokio::sync::watch;

    /// Scripted process: exits on the first signal it honours.
    struct FakeProcess {
        pid: u32,
        honours: Vec<Signal>,
        signals: SyncMutex<Vec<Signal>>,
        exit: watch::Sender<Option<i32>>,
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn signal(&self, signal: Signal) -> Result<()> {
            self.signals.lock().push(signal);
            if self.honours.contains(&signal) {
                self.exit.send_replace(Some(128 + signal as i32));
            }
            Ok(())
        }

        async fn wait(&self) -> i32 {
            let mut rx = self.exit.subscribe();
            let code = rx.wait_for(|c| c.is_some()).await.map(|c| (*c).unwrap_or(-1));
            code.unwrap_or(-1)
        }

        fn try_exit_code(&self) -> Option<i32> {
            *self.exit.borrow()
        }
    }

    struct FakeLauncher {
        honours: Vec<Signal>,
        next_pid: AtomicU32,
        launched: SyncMutex<Vec<Arc<FakeProcess>>>,
    }

    impl FakeLauncher {
        fn new(honours: &[Signal]) -> Self {
            Self {
                honours: honours.to_vec(),
                next_pid: AtomicU32::new(1000),
                launched: SyncMutex::new(Vec::new()),
            }
        }

        fn last(&self) -> Arc<FakeProcess> {
            self.launched.lock().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl ProcessLauncher for FakeLauncher {
        async fn launch(&self, _spec: &ProcessSpec) -> Result<Arc<dyn ProcessHandle>> {
            let (exit, _) = watch::channel(None);
            let process = Arc::new(FakeProcess {
                pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
                honours: self.honours.clone(),
                signals: SyncMutex::new(Vec::new()),
                exit,
            });
            self.launched.lock().push(process.clone());
            Ok(process)
        }

        fn attach(&self, _pid: u32) -> Option<Arc<dyn ProcessHandle>> {
            None
        }

        async fn exec(&self, spec: &ProcessSpec) -> Result<ExecOutput> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: spec.argv.join(" ").into_bytes(),
                stderr: Vec::new(),
            })
        }
    }

    struct Fixture {
        tmp: TempDir,
        images: Arc<ImageStore>,
        image: ImageId,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layers = Arc::new(LayerStore::open(&tmp.path().join("layers")).unwrap());
        let images = Arc::new(
            ImageStore::open(&tmp.path().join("images"), layers.clone(), Arc::new(MemoryTagStore::new()))
                .unwrap(),
        );
        let mut rootfs = Snapshot::new();
        rootfs.write_file("etc/motd", "welcome\n", 0o644).unwrap();
        let layer = layers.put_changes(&Snapshot::new().diff(&rootfs)).unwrap();
        let image = Image::new(
            vec![layer],
            ImageConfig {
                cmd: Some(vec!["sleep".into(), "30".into()]),
                ..Default::default()
            },
            Vec::new(),
        )
        .unwrap();
        let id = image.id.clone();
        images.insert(image).unwrap();
        images.tag(&id, &ImageReference::parse("app:1").unwrap()).unwrap();
        Fixture { tmp, images, image: id }
    }

    async fn manager(f: &Fixture, launcher: Arc<dyn ProcessLauncher>) -> ContainerManager {
        let manager = ContainerManager::new(
            &f.tmp.path().join("containers"),
            f.images.clone(),
            launcher,
            IsolationMode::Process,
        )
        .with_kill_grace(Duration::from_millis(200));
        manager.load().await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_create_materializes_rootfs() {
        let f = fixture();
        let m = manager(&f, Arc::new(FakeLauncher::new(&[Signal::SIGTERM]))).await;

        let record = m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
        assert_eq!(record.state, ContainerState::Created);
        assert_eq!(record.image_id, f.image);
        let motd = f.tmp.path().join("containers").join(&record.id).join("rootfs/etc/motd");
        assert_eq!(std::fs::read_to_string(motd).unwrap(), "welcome\n");

        let err = m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap_err();
        assert!(matches!(err, DocklingError::NameConflict(ref name) if name == "web"));
        assert_eq!(err.exit_code(), 3);
        let err = m.create("missing", &ContainerConfig::default(), None).await.unwrap_err();
        assert!(matches!(err, DocklingError::NotFound { kind: "image", .. }));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGTERM]));
        let m = manager(&f, launcher.clone()).await;
        let mut events = m.events().subscribe();

        m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
        let running = m.start("web").await.unwrap();
        assert_eq!(running.state, ContainerState::Running);
        assert!(matches!(m.start("web").await.unwrap_err(), DocklingError::AlreadyRunning(_)));

        let stopped = m.stop("web", Duration::from_secs(5)).await.unwrap();
        assert_eq!(stopped.state, ContainerState::Stopped);
        assert_eq!(stopped.exit_code, Some(143));
        assert_eq!(*launcher.last().signals.lock(), vec![Signal::SIGTERM]);
        assert!(matches!(
            m.stop("web", Duration::from_secs(1)).await.unwrap_err(),
            DocklingError::InvalidState { .. }
        ));

        let mut keys = Vec::new();
        while let Ok(event) = events.try_recv() {
            keys.push(event.key);
        }
        assert_eq!(keys, vec![
            events::CONTAINER_CREATE,
            events::CONTAINER_START,
            events::CONTAINER_DIE,
            events::CONTAINER_STOP,
        ]);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGKILL]));
        let m = manager(&f, launcher.clone()).await;

        m.create("app:1", &ContainerConfig::default(), Some("stubborn")).await.unwrap();
        m.start("stubborn").await.unwrap();

        let begun = std::time::Instant::now();
        let stopped = m.stop("stubborn", Duration::from_millis(100)).await.unwrap();
        assert!(begun.elapsed() < Duration::from_millis(100) + Duration::from_millis(200) + Duration::from_secs(1));
        assert_eq!(stopped.state, ContainerState::Stopped);
        assert_eq!(stopped.exit_code, Some(137));
        assert_eq!(*launcher.last().signals.lock(), vec![Signal::SIGTERM, Signal::SIGKILL]);
    }

    #[tokio::test]
    async fn test_stop_bounded_when_process_ignores_kill() {
        let f = fixture();
        let m = manager(&f, Arc::new(FakeLauncher::new(&[]))).await;

        m.create("app:1", &ContainerConfig::default(), Some("zombie")).await.unwrap();
        m.start("zombie").await.unwrap();
        let stopped = m.stop("zombie", Duration::from_millis(50)).await.unwrap();
        assert_eq!(stopped.state, ContainerState::Stopped);
        assert_eq!(stopped.exit_code, Some(KILLED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_process_exit_is_recorded() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[]));
        let m = manager(&f, launcher.clone()).await;

        m.create("app:1", &ContainerConfig::default(), Some("job")).await.unwrap();
        m.start("job").await.unwrap();
        launcher.last().exit.send_replace(Some(3));

        assert_eq!(m.wait("job").await.unwrap(), 3);
        let record = m.inspect("job").unwrap();
        assert_eq!(record.state, ContainerState::Stopped);
        assert_eq!(record.exit_code, Some(3));
        assert_eq!(record.pid, None);
    }

    #[tokio::test]
    async fn test_remove_requires_force_when_running() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGKILL]));
        let m = manager(&f, launcher.clone()).await;

        let record = m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
        m.start("web").await.unwrap();

        assert!(matches!(m.remove("web", false).await.unwrap_err(), DocklingError::ContainerRunning(_)));
        assert_eq!(m.inspect("web").unwrap().state, ContainerState::Running);

        m.remove("web", true).await.unwrap();
        assert_eq!(*launcher.last().signals.lock(), vec![Signal::SIGKILL]);
        assert!(matches!(m.inspect("web").unwrap_err(), DocklingError::NotFound { .. }));
        assert!(!f.tmp.path().join("containers").join(&record.id).exists());

        // The name is free again.
        m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_counts() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGTERM]));
        let m = manager(&f, launcher.clone()).await;

        m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
        let first = m.start("web").await.unwrap().pid;
        let restarted = m.restart("web", Duration::from_secs(1)).await.unwrap();
        assert_eq!(restarted.state, ContainerState::Running);
        assert_eq!(restarted.restart_count, 1);
        assert_ne!(restarted.pid, first);
    }

    #[tokio::test]
    async fn test_start_racing_forced_remove() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGKILL]));
        let m = manager(&f, launcher.clone()).await;
        let record = m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();

        let (started, removed) = tokio::join!(m.start("web"), m.remove("web", true));
        assert_eq!(removed.unwrap(), record.id);
        if let Err(e) = started {
            assert!(matches!(e, DocklingError::NotFound { .. }), "{}", e);
        }

        assert!(matches!(m.inspect("web").unwrap_err(), DocklingError::NotFound { .. }));
        assert!(!f.tmp.path().join("containers").join(&record.id).exists());
        for process in launcher.launched.lock().iter() {
            assert!(process.try_exit_code().is_some(), "process {} left running", process.pid);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_during_restart() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGTERM]));
        let m = manager(&f, launcher.clone()).await;
        m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
        m.start("web").await.unwrap();

        let (restarted, stopped) = tokio::join!(
            m.restart("web", Duration::from_secs(1)),
            m.stop("web", Duration::from_secs(1))
        );
        assert_eq!(restarted.unwrap().restart_count, 1);
        assert_eq!(stopped.unwrap().state, ContainerState::Stopped);

        let record = m.inspect("web").unwrap();
        let alive: Vec<u32> = launcher
            .launched
            .lock()
            .iter()
            .filter(|p| p.try_exit_code().is_none())
            .map(|p| p.pid)
            .collect();
        assert_eq!(launcher.launched.lock().len(), 2);
        match record.state {
            ContainerState::Running => assert_eq!(alive, vec![record.pid.unwrap()]),
            ContainerState::Stopped => assert!(alive.is_empty(), "{:?}", alive),
            other => panic!("unexpected state {}", other),
        }
    }

    #[tokio::test]
    async fn test_auto_remove_on_exit() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[]));
        let m = manager(&f, launcher.clone()).await;

        let overrides = ContainerConfig {
            auto_remove: true,
            ..Default::default()
        };
        m.create("app:1", &overrides, Some("once")).await.unwrap();
        m.start("once").await.unwrap();
        launcher.last().exit.send_replace(Some(0));

        for _ in 0..50 {
            if m.inspect("once").is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("container was not removed");
    }

    #[tokio::test]
    async fn test_resolution() {
        let f = fixture();
        let m = manager(&f, Arc::new(FakeLauncher::new(&[]))).await;

        let a = m.create("app:1", &ContainerConfig::default(), Some("alpha")).await.unwrap();
        let b = m.create("app:1", &ContainerConfig::default(), None).await.unwrap();
        assert!(b.name.contains('_'));

        assert_eq!(m.resolve("alpha").unwrap(), a.id);
        assert_eq!(m.resolve(&a.id).unwrap(), a.id);
        assert_eq!(m.resolve(&b.short_id).unwrap(), b.id);
        assert!(matches!(m.resolve("zzz").unwrap_err(), DocklingError::NotFound { .. }));

        // A name takes precedence over an id prefix.
        let prefix = &a.id[..1];
        let c = m.create("app:1", &ContainerConfig::default(), Some(prefix)).await.unwrap();
        assert_eq!(m.resolve(prefix).unwrap(), c.id);
    }

    #[tokio::test]
    async fn test_list_filters_and_order() {
        let f = fixture();
        let launcher = Arc::new(FakeLauncher::new(&[Signal::SIGTERM]));
        let m = manager(&f, launcher).await;

        m.create("app:1", &ContainerConfig::default(), Some("one")).await.unwrap();
        m.create("app:1", &ContainerConfig::default(), Some("two")).await.unwrap();
        m.start("two").await.unwrap();

        let running = m.list(&ContainerFilter::default());
        assert_eq!(running.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["two"]);

        let all = m.list(&ContainerFilter { all: true, ..Default::default() });
        assert_eq!(all.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["one", "two"]);
        assert_eq!(all[1].command, "sleep 30");

        let created = ContainerFilter::parse(false, &["status=created".into()]).unwrap();
        assert_eq!(m.list(&created).len(), 1);
        let ancestor = ContainerFilter::parse(true, &[format!("ancestor={}", f.image.short())]).unwrap();
        assert_eq!(m.list(&ancestor).len(), 2);
        assert!(m.uses_image(&f.image));
    }

    #[tokio::test]
    async fn test_exec_requires_running() {
        let f = fixture();
        let m = manager(&f, Arc::new(FakeLauncher::new(&[Signal::SIGTERM]))).await;

        m.create("app:1", &ContainerConfig::default(), Some("web")).await.unwrap();
        let err = m.exec("web", vec!["ls".into()]).await.unwrap_err();
        assert!(matches!(err, DocklingError::InvalidState { .. }));

        m.start("web").await.unwrap();
        let output = m.exec("web", vec!["ls".into(), "-l".into()]).await.unwrap();
        assert_eq!(output.stdout, b"ls -l");
    }

    #[tokio::test]
    async fn test_reload_reconciles_dead_processes() {
        let f = fixture();
        {
            let m = manager(&f, Arc::new(FakeLauncher::new(&[]))).await;
            m.create("app:1", &ContainerConfig::default(), Some("ghost")).await.unwrap();
            m.start("ghost").await.unwrap();
        }

        // FakeLauncher::attach never finds the old PID.
        let m = manager(&f, Arc::new(FakeLauncher::new(&[]))).await;
        let record = m.inspect("ghost").unwrap();
        assert_eq!(record.state, ContainerState::Stopped);
        assert_eq!(record.pid, None);
        assert!(matches!(
            m.create("app:1", &ContainerConfig::default(), Some("ghost")).await.unwrap_err(),
            DocklingError::InvalidState { .. }
        ));
    }

    #[tokio::test]
    async fn test_host_process_logs_and_commit() {
        let f = fixture();
        let m = manager(&f, Arc::new(HostLauncher::new())).await;

        let overrides = ContainerConfig {
            cmd: Some(vec![
                "/bin/sh".into(),
                "-c".into(),
                "echo one; echo two; echo three > \"$DOCKLING_ROOTFS/etc/motd\"".into(),
            ]),
            ..Default::default()
        };
        m.create("app:1", &overrides, Some("writer")).await.unwrap();
        m.start("writer").await.unwrap();
        assert_eq!(m.wait("writer").await.unwrap(), 0);

        assert_eq!(m.logs("writer", None).unwrap(), "one\ntwo\n");
        assert_eq!(m.logs("writer", Some(1)).unwrap(), "two\n");

        let reference = ImageReference::parse("app:committed").unwrap();
        let committed = m.commit("writer", Some(&reference)).await.unwrap();
        let image = f.images.resolve("app:committed").unwrap();
        assert_eq!(image.id, committed);
        assert_eq!(image.layers.len(), 2);
        let rootfs = f.images.layers().reconstruct(&image.layers).unwrap();
        match rootfs.get("etc/motd") {
            Some(crate::layer::Node::File { content, .. }) => assert_eq!(&content[..], b"three\n"),
            other => panic!("unexpected node: {:?}", other),
        }
    }

    #[test]
    fn test_tail_lines() {
        assert_eq!(tail_lines("a\nb\nc\n", 2), "b\nc\n");
        assert_eq!(tail_lines("a\nb", 5), "a\nb\n");
        assert_eq!(tail_lines("", 3), "");
    }
}
