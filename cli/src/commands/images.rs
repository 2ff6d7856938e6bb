//! `dockling images` command: List local images.

use clap::Args;
use dockling_runtime::Engine;

use crate::output;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only display image IDs
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let mut images = engine.images().list()?;
    images.sort_by(|a, b| b.created.cmp(&a.created));

    if args.quiet {
        for image in &images {
            println!("{}", image.id.short());
        }
        return Ok(());
    }

    let mut table = output::new_table(&["REPOSITORY", "TAG", "IMAGE ID", "CREATED", "SIZE"]);
    for image in &images {
        let size = output::format_bytes(image.size);
        let created = output::format_ago(&image.created);
        let id = image.id.short();
        if image.tags.is_empty() {
            table.add_row(["<none>", "<none>", id, created.as_str(), size.as_str()]);
            continue;
        }
        for tag in &image.tags {
            let (repository, tag) = output::split_tag(tag);
            table.add_row([repository.as_str(), tag.as_str(), id, created.as_str(), size.as_str()]);
        }
    }

    println!("{table}");
    Ok(())
}
