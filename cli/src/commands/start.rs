//! `dockling start` command: Start created or stopped containers.

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct StartArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,
}

pub async fn execute(args: StartArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = Vec::new();
    for query in &args.containers {
        match engine.containers().start(query).await {
            Ok(_) => println!("{query}"),
            Err(e) => failures.push((query.clone(), e)),
        }
    }
    super::finish(failures)
}
