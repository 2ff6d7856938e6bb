//! `dockling restart` command.

use std::time::Duration;

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct RestartArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Seconds to wait for a running container to stop before killing it
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: RestartArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| engine.stop_timeout());

    let mut failures = Vec::new();
    for query in &args.containers {
        match engine.containers().restart(query, timeout).await {
            Ok(_) => println!("{query}"),
            Err(e) => failures.push((query.clone(), e)),
        }
    }
    super::finish(failures)
}
