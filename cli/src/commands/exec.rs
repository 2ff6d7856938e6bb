//! `dockling exec` command: Run a command in a running container.
//!
//! Prints the command's stdout/stderr and exits with its exit code.

use std::io::Write;

use clap::Args;
use dockling_runtime::Engine;

use super::ExitStatus;

#[derive(Args)]
pub struct ExecArgs {
    /// Container name or ID
    pub container: String,

    /// Command and arguments to execute
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

pub async fn execute(args: ExecArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let output = engine.containers().exec(&args.container, args.cmd).await?;

    std::io::stdout().write_all(&output.stdout)?;
    std::io::stderr().write_all(&output.stderr)?;
    std::io::stdout().flush()?;

    if output.exit_code != 0 {
        return Err(Box::new(ExitStatus(output.exit_code.clamp(1, 255))));
    }
    Ok(())
}
