//! `dockling push` command: Upload a tagged image to its registry.

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct PushArgs {
    /// Local tag naming the destination (e.g., "localhost:5000/app:1")
    pub reference: String,
}

pub async fn execute(args: PushArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let report = engine.push(&args.reference).await?;
    println!(
        "{}: {} layers pushed, {} already present",
        report.reference.familiar(),
        report.uploaded,
        report.skipped
    );
    println!("digest: {}", report.manifest_digest);
    Ok(())
}
