//! `dockling tag` command: Create a tag that refers to an existing image.

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct TagArgs {
    /// Source image (reference or ID)
    pub source: String,

    /// Target reference (e.g., "myrepo/app:v2")
    pub target: String,
}

pub async fn execute(args: TagArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    engine.tag(&args.source, &args.target)?;
    Ok(())
}
