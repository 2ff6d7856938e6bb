//! `dockling inspect` command: Detailed container or image information as JSON.
//!
//! Each name is looked up as a container first, then as an image.

use clap::Args;
use dockling_core::DocklingError;
use dockling_runtime::Engine;

#[derive(Args)]
pub struct InspectArgs {
    /// Container or image name(s)/ID(s)
    #[arg(required = true)]
    pub targets: Vec<String>,
}

pub async fn execute(args: InspectArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let mut documents = Vec::new();
    let mut failures = Vec::new();

    for target in &args.targets {
        match lookup(engine, target) {
            Ok(document) => documents.push(document),
            Err(e) => failures.push((target.clone(), e)),
        }
    }

    println!("{}", serde_json::to_string_pretty(&documents)?);
    super::finish(failures)
}

fn lookup(engine: &Engine, target: &str) -> Result<serde_json::Value, DocklingError> {
    match engine.containers().inspect(target) {
        Ok(record) => return Ok(serde_json::to_value(record)?),
        Err(DocklingError::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }
    match engine.images().resolve(target) {
        Ok(image) => {
            let tags = engine.images().tags_for(&image.id)?;
            let mut value = serde_json::to_value(&image)?;
            if let Some(object) = value.as_object_mut() {
                object.insert("tags".to_string(), serde_json::json!(tags));
            }
            Ok(value)
        }
        Err(DocklingError::NotFound { .. }) => Err(DocklingError::not_found("object", target)),
        Err(e) => Err(e),
    }
}
