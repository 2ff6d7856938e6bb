//! `dockling stop` command: Graceful stop of one or more containers.
//!
//! Sends SIGTERM, waits up to the timeout, then SIGKILL.

use std::time::Duration;

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct StopArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Seconds to wait before killing (default: stop_timeout_secs from config)
    #[arg(short = 't', long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: StopArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = args
        .timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| engine.stop_timeout());

    let mut failures = Vec::new();
    for query in &args.containers {
        match engine.containers().stop(query, timeout).await {
            Ok(_) => println!("{query}"),
            Err(e) => failures.push((query.clone(), e)),
        }
    }
    super::finish(failures)
}
