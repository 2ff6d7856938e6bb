//! `dockling ps` command: List containers.

use clap::Args;
use dockling_runtime::{ContainerFilter, Engine};

use crate::output;

/// Width of the COMMAND column before truncation.
const COMMAND_WIDTH: usize = 20;

#[derive(Args)]
pub struct PsArgs {
    /// Show all containers (default shows just running)
    #[arg(short, long)]
    pub all: bool,

    /// Only display container IDs
    #[arg(short, long)]
    pub quiet: bool,

    /// Filter output (status=, name=, ancestor=, id=)
    #[arg(short, long = "filter")]
    pub filters: Vec<String>,

    /// Don't truncate IDs and commands
    #[arg(long)]
    pub no_trunc: bool,
}

pub async fn execute(args: PsArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let filter = ContainerFilter::parse(args.all, &args.filters)?;
    let containers = engine.containers().list(&filter);

    // --quiet: print only IDs
    if args.quiet {
        for summary in &containers {
            let id = if args.no_trunc { &summary.id } else { &summary.short_id };
            println!("{id}");
        }
        return Ok(());
    }

    let mut table =
        output::new_table(&["CONTAINER ID", "IMAGE", "COMMAND", "CREATED", "STATUS", "NAMES"]);
    for summary in &containers {
        let (id, command) = if args.no_trunc {
            (summary.id.as_str(), format!("\"{}\"", summary.command))
        } else {
            (
                summary.short_id.as_str(),
                output::truncate_command(&summary.command, COMMAND_WIDTH),
            )
        };
        let created = output::format_ago(&summary.created_at);
        let status = output::format_status(summary);
        table.add_row([
            id,
            summary.image.as_str(),
            command.as_str(),
            created.as_str(),
            status.as_str(),
            summary.name.as_str(),
        ]);
    }

    println!("{table}");
    Ok(())
}
