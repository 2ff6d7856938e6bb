//! `dockling commit` command: Create an image from a container's changes.

use clap::Args;
use dockling_runtime::{Engine, ImageReference};

#[derive(Args)]
pub struct CommitArgs {
    /// Container name or ID
    pub container: String,

    /// Reference to tag the new image with
    pub reference: Option<String>,
}

pub async fn execute(args: CommitArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let reference = args
        .reference
        .as_deref()
        .map(ImageReference::parse)
        .transpose()?;
    let id = engine
        .containers()
        .commit(&args.container, reference.as_ref())
        .await?;
    println!("{id}");
    Ok(())
}
