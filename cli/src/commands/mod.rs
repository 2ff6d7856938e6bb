//! CLI command definitions and dispatch.

mod build;
mod commit;
mod create;
mod exec;
mod images;
mod inspect;
mod login;
mod logout;
mod logs;
mod ps;
mod pull;
mod push;
mod restart;
mod rm;
mod rmi;
mod run;
mod start;
mod stop;
mod tag;
mod version;

use std::fmt;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use dockling_core::{DocklingError, EngineConfig};
use dockling_runtime::Engine;

/// Dockling - a small Docker-like container engine.
#[derive(Parser)]
#[command(name = "dockling", version, about)]
pub struct Cli {
    /// State directory (default: $DOCKLING_ROOT or ~/.dockling)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a Dockerfile
    Build(build::BuildArgs),
    /// Create and start a new container from an image
    Run(run::RunArgs),
    /// Create a new container without starting it
    Create(create::CreateArgs),
    /// Start one or more created or stopped containers
    Start(start::StartArgs),
    /// Gracefully stop one or more running containers
    Stop(stop::StopArgs),
    /// Restart one or more containers
    Restart(restart::RestartArgs),
    /// Remove one or more containers
    Rm(rm::RmArgs),
    /// List containers
    Ps(ps::PsArgs),
    /// Fetch the console output of a container
    Logs(logs::LogsArgs),
    /// Execute a command in a running container
    Exec(exec::ExecArgs),
    /// Create a new image from a container's changes
    Commit(commit::CommitArgs),
    /// Display detailed container or image information as JSON
    Inspect(inspect::InspectArgs),
    /// List images
    Images(images::ImagesArgs),
    /// Remove one or more images
    Rmi(rmi::RmiArgs),
    /// Create a tag that refers to an existing image
    Tag(tag::TagArgs),
    /// Push an image to a registry
    Push(push::PushArgs),
    /// Pull an image from a registry
    Pull(pull::PullArgs),
    /// Store registry credentials
    Login(login::LoginArgs),
    /// Remove stored registry credentials
    Logout(logout::LogoutArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Terminates the CLI with a container's exit status, without an error message.
#[derive(Debug)]
pub struct ExitStatus(pub i32);

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit status {}", self.0)
    }
}

impl std::error::Error for ExitStatus {}

/// Resolve the configuration and open the engine.
pub(crate) async fn open_engine(root: Option<&Path>) -> Result<Engine, Box<dyn std::error::Error>> {
    let config = EngineConfig::load(root)?;
    tracing::debug!(root = %config.root.display(), "Opening engine");
    Ok(Engine::open(config).await?)
}

/// Report per-target failures of a multi-target command.
///
/// Every failure but the last is printed; the last is returned so its exit
/// code reaches the entrypoint.
pub(crate) fn finish(failures: Vec<(String, DocklingError)>) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = failures.into_iter().peekable();
    while let Some((target, error)) = failures.next() {
        if failures.peek().is_none() {
            return Err(Box::new(error));
        }
        eprintln!("Error: {target}: {error}");
    }
    Ok(())
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    if matches!(cli.command, Command::Version(_)) {
        return version::execute(version::VersionArgs).await;
    }

    let engine = open_engine(cli.root.as_deref()).await?;
    match cli.command {
        Command::Build(args) => build::execute(args, &engine).await,
        Command::Run(args) => run::execute(args, &engine).await,
        Command::Create(args) => create::execute(args, &engine).await,
        Command::Start(args) => start::execute(args, &engine).await,
        Command::Stop(args) => stop::execute(args, &engine).await,
        Command::Restart(args) => restart::execute(args, &engine).await,
        Command::Rm(args) => rm::execute(args, &engine).await,
        Command::Ps(args) => ps::execute(args, &engine).await,
        Command::Logs(args) => logs::execute(args, &engine).await,
        Command::Exec(args) => exec::execute(args, &engine).await,
        Command::Commit(args) => commit::execute(args, &engine).await,
        Command::Inspect(args) => inspect::execute(args, &engine).await,
        Command::Images(args) => images::execute(args, &engine).await,
        Command::Rmi(args) => rmi::execute(args, &engine).await,
        Command::Tag(args) => tag::execute(args, &engine).await,
        Command::Push(args) => push::execute(args, &engine).await,
        Command::Pull(args) => pull::execute(args, &engine).await,
        Command::Login(args) => login::execute(args, &engine).await,
        Command::Logout(args) => logout::execute(args, &engine).await,
        Command::Version(_) => Ok(()),
    }
}
