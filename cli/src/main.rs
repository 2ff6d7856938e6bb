//! Dockling CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dockling_cli::commands::{dispatch, Cli, ExitStatus};
use dockling_core::DocklingError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = dispatch(cli).await {
        if let Some(status) = e.downcast_ref::<ExitStatus>() {
            std::process::exit(status.0);
        }
        eprintln!("Error: {e}");
        let code = e
            .downcast_ref::<DocklingError>()
            .map(DocklingError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}
