//! `dockling version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("dockling version {}", dockling_core::VERSION);
    println!("runtime version {}", dockling_runtime::VERSION);
    Ok(())
}
