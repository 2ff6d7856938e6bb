//! Image records: an ordered layer stack plus runtime configuration.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use dockling_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::digest::{Digest, ImageId, LayerId};

/// Runtime defaults baked into an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Entrypoint command
    pub entrypoint: Option<Vec<String>>,
    /// Default command
    pub cmd: Option<Vec<String>>,
    /// Environment variables (KEY=VALUE)
    pub env: Vec<String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Exposed ports ("80/tcp")
    pub exposed_ports: BTreeSet<String>,
    /// User to run as
    pub user: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
}

impl ImageConfig {
    /// Value of an environment variable.
    pub fn env_get(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then_some(v)
        })
    }

    /// Set or replace an environment variable, keeping declaration order.
    pub fn set_env(&mut self, key: &str, value: &str) {
        let entry = format!("{}={}", key, value);
        match self
            .env
            .iter_mut()
            .find(|e| e.split_once('=').map(|(k, _)| k) == Some(key))
        {
            Some(existing) => *existing = entry,
            None => self.env.push(entry),
        }
    }

    /// Environment as a map.
    pub fn env_map(&self) -> BTreeMap<String, String> {
        self.env
            .iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// One history entry per recipe instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Instruction that produced the entry
    pub created_by: String,
    /// Whether the instruction produced no layer
    #[serde(default)]
    pub empty_layer: bool,
    /// When the instruction ran
    pub created: DateTime<Utc>,
}

/// An immutable image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Content identity of `{layers, config}`
    pub id: ImageId,
    /// Layer stack, bottom to top
    pub layers: Vec<LayerId>,
    /// Runtime configuration
    pub config: ImageConfig,
    /// Build history
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Creation time
    pub created: DateTime<Utc>,
}

#[derive(Serialize)]
struct Canonical<'a> {
    layers: &'a [LayerId],
    config: &'a ImageConfig,
}

impl Image {
    /// Assemble an image and derive its identity.
    pub fn new(layers: Vec<LayerId>, config: ImageConfig, history: Vec<HistoryEntry>) -> Result<Self> {
        let id = Self::compute_id(&layers, &config)?;
        Ok(Self {
            id,
            layers,
            config,
            history,
            created: Utc::now(),
        })
    }

    /// Identity: digest of the canonical JSON of the layers and config.
    ///
    /// Timestamps and history are excluded, so identical builds share an id.
    pub fn compute_id(layers: &[LayerId], config: &ImageConfig) -> Result<ImageId> {
        let canonical = serde_json::to_vec(&Canonical { layers, config })?;
        Ok(Digest::of(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ImageConfig {
        let mut config = ImageConfig {
            cmd: Some(vec!["/app/server".to_string()]),
            ..Default::default()
        };
        config.set_env("PATH", "/usr/bin:/bin");
        config
    }

    #[test]
    fn test_identity_ignores_history_and_time() {
        let layers = vec![Digest::of(b"layer")];
        let a = Image::new(layers.clone(), config(), Vec::new()).unwrap();
        let b = Image::new(
            layers,
            config(),
            vec![HistoryEntry {
                created_by: "RUN true".to_string(),
                empty_layer: false,
                created: Utc::now(),
            }],
        )
        .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn test_identity_tracks_layers_and_config() {
        let base = Image::new(vec![Digest::of(b"a")], config(), Vec::new()).unwrap();
        let other_layers = Image::new(vec![Digest::of(b"b")], config(), Vec::new()).unwrap();
        let mut changed = config();
        changed.user = Some("nobody".to_string());
        let other_config = Image::new(vec![Digest::of(b"a")], changed, Vec::new()).unwrap();

        assert_ne!(base.id, other_layers.id);
        assert_ne!(base.id, other_config.id);
    }

    #[test]
    fn test_set_env_replaces_in_place() {
        let mut config = config();
        config.set_env("APP", "1");
        config.set_env("PATH", "/bin");
        assert_eq!(config.env, vec!["PATH=/bin".to_string(), "APP=1".to_string()]);
        assert_eq!(config.env_get("APP"), Some("1"));
        assert_eq!(config.env_get("MISSING"), None);
    }
}
