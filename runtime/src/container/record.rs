//! Persisted container records, listing filters and name generation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dockling_core::error::{DocklingError, Result};
use serde::{Deserialize, Serialize};

use super::state::ContainerState;
use crate::digest::ImageId;
use crate::image::ImageConfig;

/// User-supplied overrides for a new container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Entrypoint override (`--entrypoint`)
    pub entrypoint: Option<Vec<String>>,
    /// Command override (trailing args)
    pub cmd: Option<Vec<String>>,
    /// Extra environment (KEY=VALUE), applied over the image's
    pub env: Vec<String>,
    /// Working directory override
    pub working_dir: Option<String>,
    /// User override
    pub user: Option<String>,
    /// Remove the container once it stops
    pub auto_remove: bool,
}

impl ContainerConfig {
    /// Merge with image defaults into the effective configuration.
    pub fn resolve(&self, image: &ImageConfig) -> ContainerConfig {
        let mut env = image.clone();
        for entry in &self.env {
            match entry.split_once('=') {
                Some((k, v)) => env.set_env(k, v),
                None => env.set_env(entry, ""),
            }
        }

        // An entrypoint override drops the image's CMD unless one is given.
        let cmd = match (&self.entrypoint, &self.cmd) {
            (_, Some(cmd)) => Some(cmd.clone()),
            (Some(_), None) => None,
            (None, None) => image.cmd.clone(),
        };

        ContainerConfig {
            entrypoint: self.entrypoint.clone().or_else(|| image.entrypoint.clone()),
            cmd,
            env: env.env,
            working_dir: self
                .working_dir
                .clone()
                .or_else(|| image.working_dir.clone()),
            user: self.user.clone().or_else(|| image.user.clone()),
            auto_remove: self.auto_remove,
        }
    }

    /// Entrypoint followed by command.
    pub fn argv(&self) -> Vec<String> {
        self.entrypoint
            .iter()
            .flatten()
            .chain(self.cmd.iter().flatten())
            .cloned()
            .collect()
    }
}

/// Metadata record for a single container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Full id (32 hex chars)
    pub id: String,
    /// First 12 chars of the id
    pub short_id: String,
    /// User-assigned or generated name
    pub name: String,
    /// Image the container was created from
    pub image_id: ImageId,
    /// Reference as given on the command line
    pub image_ref: String,
    /// Effective configuration (image defaults merged with overrides)
    pub config: ContainerConfig,
    pub state: ContainerState,
    /// Main process PID while running
    pub pid: Option<u32>,
    /// Exit code of the last run (`None` if unknown)
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub restart_count: u32,
}

impl ContainerRecord {
    /// Short id from a full id.
    pub fn make_short_id(id: &str) -> String {
        id.chars().take(12).collect()
    }

    /// Command line as shown in listings.
    pub fn command(&self) -> String {
        self.config.argv().join(" ")
    }
}

/// Paths owned by a container.
#[derive(Debug, Clone)]
pub struct ContainerPaths {
    pub dir: PathBuf,
}

impl ContainerPaths {
    pub fn new(containers_dir: &Path, id: &str) -> Self {
        Self {
            dir: containers_dir.join(id),
        }
    }

    pub fn record(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn rootfs(&self) -> PathBuf {
        self.dir.join("rootfs")
    }

    pub fn console_log(&self) -> PathBuf {
        self.dir.join("console.log")
    }
}

/// Listing entry for `ps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub short_id: String,
    pub name: String,
    pub image: String,
    pub image_id: ImageId,
    pub command: String,
    pub state: ContainerState,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&ContainerRecord> for ContainerSummary {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            id: record.id.clone(),
            short_id: record.short_id.clone(),
            name: record.name.clone(),
            image: record.image_ref.clone(),
            image_id: record.image_id.clone(),
            command: record.command(),
            state: record.state,
            exit_code: record.exit_code,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
        }
    }
}

/// `ps` filter. Without `all`, only running containers are listed.
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    pub all: bool,
    pub status: Option<ContainerState>,
    pub name: Option<String>,
    /// Image reference or id prefix
    pub ancestor: Option<String>,
    /// Id prefix
    pub id: Option<String>,
}

impl ContainerFilter {
    /// Build from `--all` and `key=value` filter strings.
    pub fn parse(all: bool, filters: &[String]) -> Result<Self> {
        let mut filter = ContainerFilter {
            all,
            ..Default::default()
        };
        for raw in filters {
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                DocklingError::Other(format!("invalid filter '{}': expected key=value", raw))
            })?;
            match key {
                "status" => {
                    filter.status = Some(value.parse()?);
                    // Filtering by status implies looking past running containers.
                    filter.all = true;
                }
                "name" => filter.name = Some(value.to_string()),
                "ancestor" => filter.ancestor = Some(value.to_string()),
                "id" => filter.id = Some(value.to_string()),
                other => {
                    return Err(DocklingError::Other(format!(
                        "unknown filter '{}' (supported: status, name, ancestor, id)",
                        other
                    )))
                }
            }
        }
        Ok(filter)
    }

    /// Whether a record passes. `ancestor_id` is the resolved ancestor image, if any.
    pub fn matches(&self, record: &ContainerRecord, ancestor_id: Option<&ImageId>) -> bool {
        if !self.all && record.state != ContainerState::Running {
            return false;
        }
        if let Some(status) = self.status {
            if record.state != status {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !record.name.contains(name.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if !record.id.starts_with(id.as_str()) {
                return false;
            }
        }
        if let Some(ancestor) = &self.ancestor {
            let by_id = ancestor_id.is_some_and(|id| *id == record.image_id);
            if !by_id && record.image_ref != *ancestor {
                return false;
            }
        }
        true
    }
}

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "clever", "dapper", "eager", "fervent", "gentle", "hardy", "jolly",
    "lively", "merry", "nimble", "plucky", "quiet", "rustic", "serene", "steady", "sunny",
    "tender", "upbeat", "valiant", "witty", "zesty", "bright", "crisp", "daring", "frosty",
    "golden", "humble", "mellow", "patient", "proud",
];

const NOUNS: &[&str] = &[
    "albatross", "badger", "cedar", "dolphin", "ember", "falcon", "glacier", "harbor",
    "iris", "juniper", "kestrel", "lagoon", "meadow", "nebula", "otter", "pebble",
    "quartz", "raven", "sparrow", "tundra", "willow", "yarrow", "aurora", "boulder",
    "canyon", "delta", "fjord", "grove", "heron", "lantern", "maple", "orchid",
];

/// Generate a random `adjective_noun` name.
pub fn generate_name() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
    format!("{adj}_{noun}")
}

/// Names must start alphanumeric and continue with `[a-zA-Z0-9_.-]`.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(DocklingError::Other(format!(
            "invalid container name '{}': only [a-zA-Z0-9][a-zA-Z0-9_.-] are allowed",
            name
        )))
    }
}
