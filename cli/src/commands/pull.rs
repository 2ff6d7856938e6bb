//! `dockling pull` command: Download an image from a registry.

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct PullArgs {
    /// Image reference (e.g., "alpine:3.19", "ghcr.io/org/app@sha256:...")
    pub reference: String,

    /// Only print the image ID
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: PullArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let report = engine.pull(&args.reference).await?;
    if args.quiet {
        println!("{}", report.image_id);
        return Ok(());
    }

    if report.downloaded == 0 {
        println!("Status: Image is up to date for {}", report.reference.familiar());
    } else {
        println!(
            "Status: Downloaded newer image for {} ({} layers, {} already present)",
            report.reference.familiar(),
            report.downloaded,
            report.skipped
        );
    }
    println!("Image: {}", report.image_id);
    Ok(())
}
