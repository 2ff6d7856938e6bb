//! Host process launching, signalling and supervision.
//!
//! Isolated processes are chrooted into their rootfs inside fresh
//! mount/UTS/IPC/PID/network namespaces. Without root privileges a user
//! namespace maps the caller to root first. With a PID namespace the
//! spawned process stays outside as a supervisor: the command runs as PID 1
//! of the new namespace and the supervisor exits with its status, so the
//! engine keeps a host PID to signal and wait on.

use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockling_core::error::{DocklingError, Result};
use dockling_core::IsolationMode;
use nix::errno::Errno;
use nix::fcntl::{open, OFlag};
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::signal::{self, kill, killpg, SigHandler, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, setgid, setgroups, setsid, setuid, ForkResult, Gid, Pid, Uid};
use tokio::process::Command;
use tokio::sync::watch;

use crate::build::context::resolve_in;

/// `PATH` given to container and build processes.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Interval between liveness checks of attached processes.
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Signals a PID namespace supervisor ignores. They reach PID 1 through the
/// process group.
const SUPERVISOR_IGNORED: [Signal; 6] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Highest descriptor the supervisor closes after forking PID 1.
const SUPERVISOR_MAX_FD: i32 = 1024;

/// Namespaces unshared before entering the rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet {
    pub mount: bool,
    pub uts: bool,
    pub ipc: bool,
    pub pid: bool,
    pub network: bool,
}

impl NamespaceSet {
    pub fn all() -> Self {
        Self {
            mount: true,
            uts: true,
            ipc: true,
            pid: true,
            network: true,
        }
    }

    pub fn none() -> Self {
        Self {
            mount: false,
            uts: false,
            ipc: false,
            pid: false,
            network: false,
        }
    }

    fn flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }
}

fn cstring(value: &[u8]) -> Result<CString> {
    CString::new(value)
        .map_err(|_| DocklingError::ProcessError("path contains a NUL byte".to_string()))
}

/// Configure `cmd` to run chrooted in `rootfs` with its own session and
/// the given namespaces. `workdir` is absolute inside the rootfs.
pub(crate) fn apply_isolation(
    cmd: &mut Command,
    rootfs: &Path,
    workdir: &str,
    user: Option<&str>,
    namespaces: NamespaceSet,
) -> Result<()> {
    let root = cstring(rootfs.as_os_str().as_bytes())?;
    let dir = cstring(workdir.as_bytes())?;
    let rootless = !Uid::effective().is_root();

    let ids = match user {
        Some(spec) => match resolve_user(rootfs, spec)? {
            (0, 0) => Some((0, 0)),
            _ if rootless => {
                tracing::warn!(user = %spec, "USER needs root privileges, running as root of the user namespace");
                None
            }
            ids => Some(ids),
        },
        None => None,
    };

    let mut flags = namespaces.flags();
    let id_maps = rootless.then(|| {
        flags |= CloneFlags::CLONE_NEWUSER;
        (
            format!("0 {} 1\n", Uid::effective()),
            format!("0 {} 1\n", Gid::effective()),
        )
    });
    let pid_namespace = namespaces.pid;
    let private_mounts = namespaces.mount;

    // SAFETY: the closure only makes async-signal-safe system calls on
    // values prepared before the fork.
    unsafe {
        cmd.pre_exec(move || {
            setsid()?;
            unshare(flags)?;
            if let Some((uid_map, gid_map)) = &id_maps {
                write_proc("/proc/self/setgroups", b"deny")?;
                write_proc("/proc/self/uid_map", uid_map.as_bytes())?;
                write_proc("/proc/self/gid_map", gid_map.as_bytes())?;
            }
            if private_mounts {
                mount(
                    None::<&str>,
                    "/",
                    None::<&str>,
                    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                    None::<&str>,
                )?;
            }
            if pid_namespace {
                become_pid_one()?;
            }
            chroot(root.as_c_str())?;
            chdir(dir.as_c_str())?;
            if let Some((uid, gid)) = ids {
                if !rootless {
                    setgroups(&[])?;
                }
                setgid(Gid::from_raw(gid))?;
                setuid(Uid::from_raw(uid))?;
            }
            Ok(())
        });
    }
    Ok(())
}

fn write_proc(path: &str, content: &[u8]) -> nix::Result<()> {
    let fd = open(path, OFlag::O_WRONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    // SAFETY: `fd` was just opened and nothing else owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    nix::unistd::write(&fd, content)?;
    Ok(())
}

/// Fork after unsharing the PID namespace. The child returns as PID 1 of
/// the namespace; the parent never returns and exits with the child's
/// status once it ends.
fn become_pid_one() -> nix::Result<()> {
    // SAFETY: both branches only make async-signal-safe calls.
    match unsafe { fork() }? {
        ForkResult::Child => prctl::set_pdeathsig(Signal::SIGKILL),
        ForkResult::Parent { child } => {
            for sig in SUPERVISOR_IGNORED {
                // SAFETY: installs SIG_IGN, no handler code runs.
                let _ = unsafe { signal::signal(sig, SigHandler::SigIgn) };
            }
            // Release the spawn status pipe; PID 1 holds its own copy.
            for fd in 3..SUPERVISOR_MAX_FD {
                let _ = nix::unistd::close(fd);
            }
            let code = loop {
                match waitpid(child, None) {
                    Ok(WaitStatus::Exited(_, code)) => break code,
                    Ok(WaitStatus::Signaled(_, sig, _)) => break 128 + sig as i32,
                    Ok(_) | Err(Errno::EINTR) => continue,
                    Err(_) => break 1,
                }
            };
            // SAFETY: _exit skips the atexit handlers inherited from the engine.
            unsafe { libc::_exit(code) }
        }
    }
}

/// Start a new session so the process heads its own process group.
fn detach_session(cmd: &mut Command) {
    // SAFETY: setsid is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| {
            setsid()?;
            Ok(())
        });
    }
}

/// Resolve `user[:group]` to numeric ids, consulting the rootfs's
/// `/etc/passwd` and `/etc/group` for names.
pub fn resolve_user(rootfs: &Path, spec: &str) -> Result<(u32, u32)> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => (uid, lookup_db(rootfs, "etc/passwd", |f| f.get(2) == Some(&user))
            .and_then(|f| f.get(3).and_then(|g| g.parse().ok()))
            .unwrap_or(uid)),
        Err(_) => {
            let fields = lookup_db(rootfs, "etc/passwd", |f| f.first() == Some(&user))
                .ok_or_else(|| {
                    DocklingError::ProcessError(format!("unable to find user {}", user))
                })?;
            let uid = fields.get(2).and_then(|v| v.parse().ok());
            let gid = fields.get(3).and_then(|v| v.parse().ok());
            match (uid, gid) {
                (Some(uid), Some(gid)) => (uid, gid),
                _ => {
                    return Err(DocklingError::ProcessError(format!(
                        "malformed passwd entry for {}",
                        user
                    )))
                }
            }
        }
    };

    let gid = match group {
        None => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup_db(rootfs, "etc/group", |f| f.first() == Some(&group))
                .and_then(|f| f.get(2).and_then(|v| v.parse().ok()))
                .ok_or_else(|| {
                    DocklingError::ProcessError(format!("unable to find group {}", group))
                })?,
        },
    };
    Ok((uid, gid))
}

fn lookup_db(
    rootfs: &Path,
    file: &str,
    pred: impl Fn(&[&str]) -> bool,
) -> Option<Vec<String>> {
    let content = std::fs::read_to_string(rootfs.join(file)).ok()?;
    content
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| pred(fields))
        .map(|fields| fields.into_iter().map(str::to_string).collect())
}

/// Conventional exit code: the status code, or 128 + signal number.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

/// Whether a process with this PID exists and has not exited. Zombies
/// (exited but unreaped) count as exited.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let exists = matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM));
    exists && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    // The state follows the parenthesised command name, which may contain spaces.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .is_some_and(|state| state == 'Z')
}

/// Everything needed to start a container process.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub argv: Vec<String>,
    /// KEY=VALUE entries
    pub env: Vec<String>,
    /// Host path of the container rootfs
    pub rootfs: PathBuf,
    /// Working directory inside the rootfs
    pub workdir: String,
    pub user: Option<String>,
    /// File receiving stdout and stderr (appended)
    pub log_path: Option<PathBuf>,
    pub isolation: IsolationMode,
}

/// Captured result of a one-off command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// A running (or finished) container process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    /// Deliver a signal to the process group, or the process alone if it
    /// does not lead a group.
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Wait for exit and return the exit code.
    async fn wait(&self) -> i32;

    /// Exit code if the process has already exited.
    fn try_exit_code(&self) -> Option<i32>;
}

/// Starts container processes.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, spec: &ProcessSpec) -> Result<Arc<dyn ProcessHandle>>;

    /// Re-acquire a process started by an earlier engine instance.
    /// `None` when no such process exists.
    fn attach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>>;

    /// Run a command to completion and capture its output.
    async fn exec(&self, spec: &ProcessSpec) -> Result<ExecOutput>;
}

/// Host process handle backed by an exit-code watch channel.
pub struct HostProcess {
    pid: u32,
    exit: watch::Receiver<Option<i32>>,
    last_signal: Arc<AtomicI32>,
}

impl HostProcess {
    fn owned(mut child: tokio::process::Child) -> Result<Self> {
        let pid = child
            .id()
            .ok_or_else(|| DocklingError::ProcessError("process exited during spawn".into()))?;
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Failed to wait for process");
                    -1
                }
            };
            let _ = tx.send(Some(code));
        });
        Ok(Self {
            pid,
            exit: rx,
            last_signal: Arc::new(AtomicI32::new(0)),
        })
    }

    fn attached(pid: u32) -> Self {
        let (tx, rx) = watch::channel(None);
        let last_signal = Arc::new(AtomicI32::new(0));
        let last = last_signal.clone();
        tokio::spawn(async move {
            while pid_alive(pid) {
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
            }
            // The real status belongs to another parent; infer from our last signal.
            let code = match last.load(Ordering::SeqCst) {
                0 => -1,
                sig => 128 + sig,
            };
            let _ = tx.send(Some(code));
        });
        Self {
            pid,
            exit: rx,
            last_signal,
        }
    }
}

#[async_trait]
impl ProcessHandle for HostProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if self.try_exit_code().is_some() {
            return Ok(());
        }
        let pid = i32::try_from(self.pid)
            .map(Pid::from_raw)
            .map_err(|_| DocklingError::ProcessError(format!("invalid pid {}", self.pid)))?;
        self.last_signal.store(signal as i32, Ordering::SeqCst);

        let result = killpg(pid, signal).or_else(|_| kill(pid, signal));
        match result {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(DocklingError::ProcessError(format!(
                "failed to signal pid {}: {}",
                self.pid, errno
            ))),
        }
    }

    async fn wait(&self) -> i32 {
        let mut rx = self.exit.clone();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(-1),
            Err(_) => -1,
        };
        code
    }

    fn try_exit_code(&self) -> Option<i32> {
        *self.exit.borrow()
    }
}

/// Launches container processes on the host.
#[derive(Debug, Clone, Default)]
pub struct HostLauncher;

impl HostLauncher {
    pub fn new() -> Self {
        Self
    }

    fn command(&self, spec: &ProcessSpec) -> Result<Command> {
        let Some(program) = spec.argv.first() else {
            return Err(DocklingError::ProcessError(
                "no command specified".to_string(),
            ));
        };
        let workdir = resolve_in("/", &spec.workdir);

        let mut cmd = match spec.isolation {
            IsolationMode::Namespaces => {
                let mut cmd = Command::new(program);
                apply_isolation(
                    &mut cmd,
                    &spec.rootfs,
                    &format!("/{}", workdir),
                    spec.user.as_deref(),
                    NamespaceSet::all(),
                )?;
                cmd
            }
            IsolationMode::Process => {
                // Prefer a binary shipped in the rootfs over the host's.
                let in_rootfs = spec.rootfs.join(resolve_in("/", program));
                let program = if program.starts_with('/') && in_rootfs.is_file() {
                    in_rootfs.into_os_string()
                } else {
                    program.into()
                };
                let host_workdir = spec.rootfs.join(&workdir);
                std::fs::create_dir_all(&host_workdir)?;

                let mut cmd = Command::new(program);
                cmd.current_dir(host_workdir);
                detach_session(&mut cmd);
                cmd
            }
        };

        cmd.args(&spec.argv[1..]);
        cmd.env_clear();
        cmd.env("PATH", DEFAULT_PATH);
        cmd.env("HOME", "/root");
        for entry in &spec.env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if spec.isolation == IsolationMode::Process {
            cmd.env("DOCKLING_ROOTFS", &spec.rootfs);
        }
        cmd.stdin(Stdio::null());
        Ok(cmd)
    }
}

#[async_trait]
impl ProcessLauncher for HostLauncher {
    async fn launch(&self, spec: &ProcessSpec) -> Result<Arc<dyn ProcessHandle>> {
        let mut cmd = self.command(spec)?;
        match &spec.log_path {
            Some(path) => {
                let log = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                cmd.stdout(Stdio::from(log.try_clone()?));
                cmd.stderr(Stdio::from(log));
            }
            None => {
                cmd.stdout(Stdio::null());
                cmd.stderr(Stdio::null());
            }
        }

        let child = cmd.spawn().map_err(|e| {
            DocklingError::ProcessError(format!("failed to start {}: {}", spec.argv[0], e))
        })?;
        let process = HostProcess::owned(child)?;
        tracing::debug!(pid = process.pid, command = ?spec.argv, "Process launched");
        Ok(Arc::new(process))
    }

    fn attach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>> {
        if !pid_alive(pid) {
            return None;
        }
        Some(Arc::new(HostProcess::attached(pid)))
    }

    async fn exec(&self, spec: &ProcessSpec) -> Result<ExecOutput> {
        let mut cmd = self.command(spec)?;
        cmd.kill_on_drop(true);
        let output = cmd.output().await.map_err(|e| {
            DocklingError::ProcessError(format!("failed to execute {}: {}", spec.argv[0], e))
        })?;
        Ok(ExecOutput {
            exit_code: exit_code(output.status),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn spec(rootfs: &Path, argv: &[&str]) -> ProcessSpec {
        ProcessSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            env: vec!["GREETING=hello".into()],
            rootfs: rootfs.to_path_buf(),
            workdir: "/".into(),
            user: None,
            log_path: Some(rootfs.join("console.log")),
            isolation: IsolationMode::Process,
        }
    }

    #[tokio::test]
    async fn test_launch_logs_and_exit_code() {
        let tmp = TempDir::new().unwrap();
        let launcher = HostLauncher::new();
        let process = launcher
            .launch(&spec(tmp.path(), &["/bin/sh", "-c", "echo $GREETING; exit 7"]))
            .await
            .unwrap();

        assert_eq!(process.wait().await, 7);
        assert_eq!(process.try_exit_code(), Some(7));
        let log = std::fs::read_to_string(tmp.path().join("console.log")).unwrap();
        assert_eq!(log, "hello\n");
    }

    #[tokio::test]
    async fn test_signal_terminates_process() {
        let tmp = TempDir::new().unwrap();
        let launcher = HostLauncher::new();
        let process = launcher
            .launch(&spec(tmp.path(), &["sleep", "30"]))
            .await
            .unwrap();
        assert!(process.try_exit_code().is_none());

        process.signal(Signal::SIGTERM).unwrap();
        assert_eq!(process.wait().await, 128 + Signal::SIGTERM as i32);
        // Signalling an exited process is a no-op.
        process.signal(Signal::SIGKILL).unwrap();
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let tmp = TempDir::new().unwrap();
        let launcher = HostLauncher::new();
        let output = launcher
            .exec(&spec(tmp.path(), &["/bin/sh", "-c", "pwd; echo err >&2; exit 2"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 2);
        assert_eq!(output.stderr, b"err\n");
        let cwd = String::from_utf8(output.stdout).unwrap();
        let expected = tmp.path().canonicalize().unwrap();
        assert_eq!(Path::new(cwd.trim()).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_launch_missing_binary_fails() {
        let tmp = TempDir::new().unwrap();
        let err = HostLauncher::new()
            .launch(&spec(tmp.path(), &["/definitely/not/here"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DocklingError::ProcessError(_)));
    }

    #[tokio::test]
    async fn test_attach() {
        let launcher = HostLauncher::new();
        let me = launcher.attach(std::process::id()).unwrap();
        assert!(me.try_exit_code().is_none());
        assert!(launcher.attach(u32::MAX).is_none());
    }

    #[test]
    fn test_unreaped_child_is_not_alive() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(300));
        assert!(!pid_alive(child.id()));
        child.wait().unwrap();
    }

    #[test]
    fn test_resolve_user() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1001::/home/app:/bin/sh\n",
        )
        .unwrap();
        std::fs::write(tmp.path().join("etc/group"), "root:x:0:\nstaff:x:50:\n").unwrap();

        assert_eq!(resolve_user(tmp.path(), "app").unwrap(), (1000, 1001));
        assert_eq!(resolve_user(tmp.path(), "app:staff").unwrap(), (1000, 50));
        assert_eq!(resolve_user(tmp.path(), "1000").unwrap(), (1000, 1001));
        assert_eq!(resolve_user(tmp.path(), "42:7").unwrap(), (42, 7));
        assert!(resolve_user(tmp.path(), "nobody").is_err());
        assert!(resolve_user(tmp.path(), "app:wheel").is_err());
    }

    #[test]
    fn test_namespace_flags() {
        assert!(NamespaceSet::none().flags().is_empty());
        assert!(NamespaceSet::all().flags().contains(CloneFlags::CLONE_NEWPID));
        let no_net = NamespaceSet {
            network: false,
            ..NamespaceSet::all()
        };
        assert!(!no_net.flags().contains(CloneFlags::CLONE_NEWNET));
        assert!(no_net.flags().contains(CloneFlags::CLONE_NEWNS));
    }

    #[tokio::test]
    async fn test_namespaced_process_runs_as_pid_one() {
        let Some(busybox) = testing::isolated_busybox().await else {
            eprintln!("skipping: namespaces or a static busybox are unavailable");
            return;
        };
        let tmp = TempDir::new().unwrap();
        let rootfs = tmp.path().join("rootfs");
        testing::install_shell(&rootfs, &busybox).unwrap();

        let mut spec = spec(&rootfs, &["/bin/sh", "-c", "echo $$ > /pid; echo started"]);
        spec.isolation = IsolationMode::Namespaces;
        spec.log_path = Some(tmp.path().join("console.log"));
        let process = HostLauncher::new().launch(&spec).await.unwrap();

        assert_eq!(process.wait().await, 0);
        assert_eq!(std::fs::read_to_string(rootfs.join("pid")).unwrap(), "1\n");
        let log = std::fs::read_to_string(tmp.path().join("console.log")).unwrap();
        assert_eq!(log, "started\n");
    }

    #[tokio::test]
    async fn test_namespaced_missing_binary_fails() {
        let tmp = TempDir::new().unwrap();
        let mut spec = spec(tmp.path(), &["/bin/sh", "-c", "true"]);
        spec.isolation = IsolationMode::Namespaces;
        spec.log_path = None;
        assert!(HostLauncher::new().launch(&spec).await.is_err());
    }
}
