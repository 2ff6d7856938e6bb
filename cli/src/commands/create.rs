//! `dockling create` command: Create a container without starting it.

use clap::Args;
use dockling_runtime::{ContainerConfig, Engine};

/// Options shared by `create` and `run`.
#[derive(Args)]
pub struct ContainerArgs {
    /// Assign a name to the container
    #[arg(long)]
    pub name: Option<String>,

    /// Environment variable (KEY=VALUE), can be repeated
    #[arg(short = 'e', long = "env")]
    pub env: Vec<String>,

    /// Working directory inside the container
    #[arg(short = 'w', long = "workdir")]
    pub workdir: Option<String>,

    /// User to run as (name or UID, optionally ":group")
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Override the image entrypoint
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Automatically remove the container when it exits
    #[arg(long)]
    pub rm: bool,

    /// Image reference or ID
    pub image: String,

    /// Command to run (overrides the image CMD)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub cmd: Vec<String>,
}

impl ContainerArgs {
    pub(super) fn overrides(&self) -> ContainerConfig {
        ContainerConfig {
            entrypoint: self
                .entrypoint
                .as_ref()
                .map(|ep| ep.split_whitespace().map(String::from).collect()),
            cmd: (!self.cmd.is_empty()).then(|| self.cmd.clone()),
            env: self.env.clone(),
            working_dir: self.workdir.clone(),
            user: self.user.clone(),
            auto_remove: self.rm,
        }
    }
}

#[derive(Args)]
pub struct CreateArgs {
    #[command(flatten)]
    pub container: ContainerArgs,
}

pub async fn execute(args: CreateArgs, engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    let container = &args.container;
    let record = engine
        .create(&container.image, &container.overrides(), container.name.as_deref())
        .await?;
    println!("{}", record.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(entrypoint: Option<&str>, cmd: &[&str]) -> ContainerArgs {
        ContainerArgs {
            name: None,
            env: vec!["A=1".to_string()],
            workdir: Some("/srv".to_string()),
            user: None,
            entrypoint: entrypoint.map(String::from),
            rm: true,
            image: "app:1".to_string(),
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_overrides_without_command_keep_image_cmd() {
        let config = args(None, &[]).overrides();
        assert_eq!(config.cmd, None);
        assert_eq!(config.entrypoint, None);
        assert_eq!(config.working_dir.as_deref(), Some("/srv"));
        assert!(config.auto_remove);
    }

    #[test]
    fn test_entrypoint_is_split_into_argv() {
        let config = args(Some("/bin/sh -c"), &["echo hi"]).overrides();
        assert_eq!(
            config.entrypoint,
            Some(vec!["/bin/sh".to_string(), "-c".to_string()])
        );
        assert_eq!(config.cmd, Some(vec!["echo hi".to_string()]));
    }
}
