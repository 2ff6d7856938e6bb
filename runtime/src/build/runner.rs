//! Execution of `RUN` instructions.

use std::path::PathBuf;

use async_trait::async_trait;
use dockling_core::error::{DocklingError, Result};
use dockling_core::IsolationMode;

use super::context::resolve_in;
use crate::container::process::{apply_isolation, NamespaceSet, DEFAULT_PATH};
use crate::fs::blocking;
use crate::layer::Snapshot;

/// Input for one `RUN` step.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Filesystem before the command
    pub rootfs: Snapshot,
    /// Command to execute
    pub argv: Vec<String>,
    /// Environment (KEY=VALUE), image env plus build args
    pub env: Vec<String>,
    /// Working directory inside the rootfs
    pub workdir: String,
    /// `USER` in effect
    pub user: Option<String>,
}

/// Runs a build command against a root filesystem and returns the result.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Execute the command; a non-zero exit is an error.
    async fn run(&self, request: RunRequest) -> Result<Snapshot>;
}

/// Runs commands on the host inside a materialized copy of the rootfs.
///
/// In `Namespaces` mode (the default) the command is chrooted into the
/// rootfs as PID 1 of fresh mount/UTS/IPC/PID namespaces and shares the
/// host network. `Process` mode is for development only: the command runs
/// the host's binaries with its working directory inside the rootfs
/// (`DOCKLING_ROOTFS` points at the rootfs root), so writes to absolute
/// paths land on the host and are not captured.
pub struct HostCommandRunner {
    isolation: IsolationMode,
    scratch_dir: PathBuf,
}

impl HostCommandRunner {
    pub fn new(isolation: IsolationMode, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            isolation,
            scratch_dir: scratch_dir.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, request: RunRequest) -> Result<Snapshot> {
        let Some(program) = request.argv.first() else {
            return Err(DocklingError::ProcessError("empty command".to_string()));
        };

        std::fs::create_dir_all(&self.scratch_dir)?;
        let dir = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&self.scratch_dir)?;
        let rootfs = dir.path().to_path_buf();
        {
            let root = rootfs.clone();
            let snapshot = request.rootfs;
            blocking("materialize", move || snapshot.materialize(&root)).await?;
        }

        let workdir = resolve_in("/", &request.workdir);
        let host_workdir = rootfs.join(&workdir);
        std::fs::create_dir_all(&host_workdir)?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(&request.argv[1..]);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for entry in &request.env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        match self.isolation {
            IsolationMode::Namespaces => {
                let namespaces = NamespaceSet {
                    network: false,
                    ..NamespaceSet::all()
                };
                apply_isolation(
                    &mut cmd,
                    &rootfs,
                    &format!("/{}", workdir),
                    request.user.as_deref(),
                    namespaces,
                )?;
            }
            IsolationMode::Process => {
                if request.user.is_some() {
                    tracing::debug!("USER is not applied in process isolation mode");
                }
                cmd.current_dir(&host_workdir);
                cmd.env("DOCKLING_ROOTFS", &rootfs);
            }
        }

        tracing::debug!(command = ?request.argv, workdir = %workdir, "Executing build command");
        let output = cmd.output().await.map_err(|e| {
            DocklingError::ProcessError(format!("failed to execute {}: {}", program, e))
        })?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::info!(target: "dockling::build", "{}", line);
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            let status = match output.status.code() {
                Some(code) => format!("exit status {}", code),
                None => "terminated by signal".to_string(),
            };
            return Err(DocklingError::ProcessError(if tail.is_empty() {
                status
            } else {
                format!("{}: {}", status, tail.join(" | "))
            }));
        }

        let captured = blocking("capture", move || Snapshot::capture(&rootfs)).await?;
        drop(dir);
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::process::testing;
    use crate::layer::Node;
    use tempfile::TempDir;

    fn request(script: &str) -> RunRequest {
        let mut rootfs = Snapshot::new();
        rootfs.write_file("app/input.txt", "data", 0o644).unwrap();
        RunRequest {
            rootfs,
            argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
            env: vec!["GREETING=built".into()],
            workdir: "/app".into(),
            user: None,
        }
    }

    #[tokio::test]
    async fn test_process_mode_captures_changes() {
        let tmp = TempDir::new().unwrap();
        let runner = HostCommandRunner::new(IsolationMode::Process, tmp.path());

        let after = runner
            .run(request("echo $GREETING > out.txt && rm input.txt"))
            .await
            .unwrap();
        match after.get("app/out.txt") {
            Some(Node::File { content, .. }) => assert_eq!(&content[..], b"built\n"),
            other => panic!("unexpected node: {:?}", other),
        }
        assert!(after.get("app/input.txt").is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_error() {
        let tmp = TempDir::new().unwrap();
        let runner = HostCommandRunner::new(IsolationMode::Process, tmp.path());

        let err = runner.run(request("echo boom >&2; exit 3")).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit status 3"), "{}", message);
        assert!(message.contains("boom"), "{}", message);
    }

    #[tokio::test]
    async fn test_scratch_space_is_cleaned_up() {
        let tmp = TempDir::new().unwrap();
        let runner = HostCommandRunner::new(IsolationMode::Process, tmp.path());
        runner.run(request("true")).await.unwrap();
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_default_mode_keeps_writes_off_the_host() {
        let tmp = TempDir::new().unwrap();
        let runner = HostCommandRunner::new(IsolationMode::default(), tmp.path().join("scratch"));
        let target = std::env::temp_dir().join(format!("dockling_escape_{}", std::process::id()));

        // The rootfs has no shell, so the command cannot run at all.
        let script = format!("echo hi > {}", target.display());
        assert!(runner.run(request(&script)).await.is_err());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_namespaced_run_captures_absolute_writes() {
        let Some(busybox) = testing::isolated_busybox().await else {
            eprintln!("skipping: namespaces or a static busybox are unavailable");
            return;
        };
        let tmp = TempDir::new().unwrap();
        let runner = HostCommandRunner::new(IsolationMode::Namespaces, tmp.path());

        let mut req = request("echo $GREETING > /out.txt; echo $$ > pid.txt");
        req.rootfs.write_file("bin/busybox", busybox.clone(), 0o755).unwrap();
        req.rootfs.write_file("bin/sh", busybox, 0o755).unwrap();
        let after = runner.run(req).await.unwrap();

        match after.get("out.txt") {
            Some(Node::File { content, .. }) => assert_eq!(&content[..], b"built\n"),
            other => panic!("unexpected node: {:?}", other),
        }
        match after.get("app/pid.txt") {
            Some(Node::File { content, .. }) => assert_eq!(&content[..], b"1\n"),
            other => panic!("unexpected node: {:?}", other),
        }
    }
}
