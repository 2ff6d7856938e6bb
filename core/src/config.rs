use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DocklingError, Result};

/// Name of the optional configuration file inside the root directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// State directory (layers, images, tags, containers)
    pub root: PathBuf,

    /// Seconds `stop` waits before escalating to SIGKILL
    pub stop_timeout_secs: u64,

    /// Registry retry policy for transient network failures
    pub retry: RetryConfig,

    /// Registries reached over plain HTTP (e.g. "localhost:5000")
    pub insecure_registries: Vec<String>,

    /// How container processes are isolated from the host
    pub isolation: IsolationMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            stop_timeout_secs: 10,
            retry: RetryConfig::default(),
            insecure_registries: Vec::new(),
            isolation: IsolationMode::default(),
        }
    }
}

impl EngineConfig {
    /// Create a configuration rooted at `root` with all other values defaulted.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Resolve the configuration.
    ///
    /// Precedence (lowest to highest): defaults, `<root>/config.yaml`,
    /// environment (`DOCKLING_ROOT`, `DOCKLING_INSECURE_REGISTRIES`,
    /// `DOCKLING_ISOLATION`), then the explicit `root` argument.
    pub fn load(root: Option<&Path>) -> Result<Self> {
        let root = root
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("DOCKLING_ROOT").map(PathBuf::from))
            .unwrap_or_else(default_root);

        let config_path = root.join(CONFIG_FILE_NAME);
        let mut config = if config_path.is_file() {
            let data = std::fs::read_to_string(&config_path).map_err(|e| {
                DocklingError::ConfigError(format!(
                    "Failed to read {}: {}",
                    config_path.display(),
                    e
                ))
            })?;
            Self::from_yaml(&data)?
        } else {
            Self::default()
        };

        if let Ok(list) = std::env::var("DOCKLING_INSECURE_REGISTRIES") {
            config.insecure_registries.extend(
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
        }

        if let Ok(mode) = std::env::var("DOCKLING_ISOLATION") {
            config.isolation = mode.parse()?;
        }

        config.root = root;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document into a configuration.
    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(DocklingError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(DocklingError::ConfigError(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the registry host should be contacted over plain HTTP.
    pub fn is_insecure(&self, registry: &str) -> bool {
        registry.starts_with("localhost")
            || registry.starts_with("127.0.0.1")
            || self.insecure_registries.iter().any(|r| r == registry)
    }
}

/// Bounded exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,

    /// Delay before the first retry
    pub base_delay_ms: u64,

    /// Ceiling on any single delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Process isolation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMode {
    /// Chroot into the rootfs inside fresh mount/UTS/IPC/PID/network
    /// namespaces. Unprivileged callers get a user namespace as well.
    #[default]
    Namespaces,

    /// Host binaries on the host filesystem, cwd inside the rootfs. Writes
    /// to absolute paths escape the container; development use only.
    Process,
}

impl std::str::FromStr for IsolationMode {
    type Err = DocklingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "namespaces" => Ok(Self::Namespaces),
            "process" => Ok(Self::Process),
            other => Err(DocklingError::ConfigError(format!(
                "unknown isolation mode '{}' (expected namespaces or process)",
                other
            ))),
        }
    }
}

/// Default state directory: `~/.dockling`.
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".dockling"))
        .unwrap_or_else(|| PathBuf::from(".dockling"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.stop_timeout_secs, 10);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.isolation, IsolationMode::Namespaces);
        assert!(config.root.ends_with(".dockling"));
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = EngineConfig::from_yaml(
            "stop_timeout_secs: 3\nretry:\n  max_attempts: 2\nisolation: process\n",
        )
        .unwrap();
        assert_eq!(config.stop_timeout_secs, 3);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 200);
        assert_eq!(config.isolation, IsolationMode::Process);
    }

    #[test]
    fn test_isolation_mode_from_str() {
        assert_eq!("Process".parse::<IsolationMode>().unwrap(), IsolationMode::Process);
        assert_eq!(" namespaces ".parse::<IsolationMode>().unwrap(), IsolationMode::Namespaces);
        assert!("vm".parse::<IsolationMode>().is_err());
    }

    #[test]
    fn test_load_reads_config_file_and_keeps_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "stop_timeout_secs: 1\ninsecure_registries: [\"registry.local:5000\"]\n",
        )
        .unwrap();

        let config = EngineConfig::load(Some(tmp.path())).unwrap();
        assert_eq!(config.root, tmp.path());
        assert_eq!(config.stop_timeout_secs, 1);
        assert!(config.is_insecure("registry.local:5000"));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = EngineConfig::load(Some(tmp.path())).unwrap();
        assert_eq!(config.stop_timeout_secs, 10);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_localhost_is_insecure() {
        let config = EngineConfig::default();
        assert!(config.is_insecure("localhost:5000"));
        assert!(!config.is_insecure("ghcr.io"));
    }
}
