//! `dockling build` command: Build an image from a Dockerfile.
//!
//! Ctrl-C cancels the build between instructions; nothing is registered
//! for a cancelled or failed build.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use dockling_runtime::{BuildOptions, Engine, ImageReference};
use tokio_util::sync::CancellationToken;

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory (contains Dockerfile and source files)
    #[arg(default_value = ".")]
    pub path: String,

    /// Name and optionally tag for the image (e.g., "myimage:latest")
    #[arg(short = 't', long = "tag")]
    pub tag: Option<String>,

    /// Path to Dockerfile (default: <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_args: Vec<String>,

    /// Do not use the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Only print the image ID
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;
    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let options = BuildOptions {
        tag: args.tag.as_deref().map(ImageReference::parse).transpose()?,
        build_args: parse_build_args(&args.build_args)?,
        no_cache: args.no_cache,
    };

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let result = engine
        .build(&context_dir, args.file.as_deref(), &options, &cancel)
        .await;
    watcher.abort();
    let report = result?;

    if args.quiet {
        println!("{}", report.image_id);
        return Ok(());
    }
    println!(
        "Successfully built {} ({} steps executed, {} cached)",
        report.image_id.short(),
        report.executed,
        report.cached
    );
    if let Some(reference) = &report.reference {
        println!("Successfully tagged {}", reference.familiar());
    }
    Ok(())
}

/// Parse `KEY=VALUE` pairs. A bare `KEY` takes its value from the
/// environment and is skipped when unset.
fn parse_build_args(raw: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut args = BTreeMap::new();
    for entry in raw {
        match entry.split_once('=') {
            Some(("", _)) => return Err(format!("Invalid --build-arg '{entry}': empty name")),
            Some((key, value)) => {
                args.insert(key.to_string(), value.to_string());
            }
            None => {
                if let Ok(value) = std::env::var(entry) {
                    args.insert(entry.clone(), value);
                }
            }
        }
    }
    Ok(args)
}
