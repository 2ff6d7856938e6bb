//! `dockling run` command: Pull (if needed) + Create + Start.
//!
//! In the foreground the console output is streamed until the container
//! exits, and the CLI exits with the container's status. Ctrl-C stops the
//! container.

use clap::Args;
use dockling_runtime::Engine;

use super::create::ContainerArgs;
use super::logs::follow;
use super::ExitStatus;

#[derive(Args)]
pub struct RunArgs {
    /// Run in detached mode and print the container ID
    #[arg(short = 'd', long)]
    pub detach: bool,

    #[command(flatten)]
    pub container: ContainerArgs,
}

pub async fn execute(args: RunArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let container = &args.container;
    let record = engine
        .run(&container.image, &container.overrides(), container.name.as_deref())
        .await?;

    if args.detach {
        println!("{}", record.id);
        return Ok(());
    }

    let containers = engine.containers();
    let path = containers.log_path(&record.id)?;
    let exited = async {
        tokio::select! {
            code = containers.wait(&record.id) => code,
            _ = tokio::signal::ctrl_c() => {
                tracing::debug!(container = %record.short_id, "Interrupted, stopping container");
                containers
                    .stop(&record.id, engine.stop_timeout())
                    .await
                    .map(|stopped| stopped.exit_code.unwrap_or(-1))
            }
        }
    };

    let code = follow(&path, 0, exited).await??;
    if code != 0 {
        return Err(Box::new(ExitStatus(code.clamp(0, 255).max(1))));
    }
    Ok(())
}
