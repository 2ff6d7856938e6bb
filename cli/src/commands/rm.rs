//! `dockling rm` command: Remove one or more containers.

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct RmArgs {
    /// Container name(s) or ID(s)
    #[arg(required = true)]
    pub containers: Vec<String>,

    /// Force removal of running containers (kills them first)
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = Vec::new();
    for query in &args.containers {
        match engine.containers().remove(query, args.force).await {
            Ok(_) => println!("{query}"),
            Err(e) => failures.push((query.clone(), e)),
        }
    }
    super::finish(failures)
}
