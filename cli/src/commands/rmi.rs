//! `dockling rmi` command: Remove one or more images.

use clap::Args;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct RmiArgs {
    /// Image references or IDs to remove
    #[arg(required = true)]
    pub images: Vec<String>,

    /// Remove the image even if it has several tags or is used by a container
    #[arg(short, long)]
    pub force: bool,
}

pub async fn execute(args: RmiArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = Vec::new();
    for query in &args.images {
        match engine.rmi(query, args.force) {
            Ok(report) => {
                for tag in &report.untagged {
                    println!("Untagged: {tag}");
                }
                if let Some(id) = &report.deleted {
                    println!("Deleted: {id}");
                }
            }
            Err(e) => failures.push((query.clone(), e)),
        }
    }
    super::finish(failures)
}
