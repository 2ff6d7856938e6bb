//! Container lifecycle states.

use std::fmt;
use std::str::FromStr;

use dockling_core::error::DocklingError;
use serde::{Deserialize, Serialize};

/// `Created → Running → Stopped → Removed`, with `Stopped → Running` on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
    Removed,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Stopped => "stopped",
            ContainerState::Removed => "removed",
        }
    }

    /// Whether `start` is allowed from this state.
    pub fn can_start(&self) -> bool {
        matches!(self, ContainerState::Created | ContainerState::Stopped)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerState {
    type Err = DocklingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "created" => Ok(ContainerState::Created),
            "running" | "up" => Ok(ContainerState::Running),
            "stopped" | "exited" => Ok(ContainerState::Stopped),
            "removed" => Ok(ContainerState::Removed),
            other => Err(DocklingError::Other(format!(
                "unknown container status '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("exited".parse::<ContainerState>().unwrap(), ContainerState::Stopped);
        assert_eq!("Running".parse::<ContainerState>().unwrap(), ContainerState::Running);
        assert!("paused".parse::<ContainerState>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&ContainerState::Stopped).unwrap();
        assert_eq!(json, "\"stopped\"");
    }

    #[test]
    fn test_can_start() {
        assert!(ContainerState::Created.can_start());
        assert!(ContainerState::Stopped.can_start());
        assert!(!ContainerState::Running.can_start());
        assert!(!ContainerState::Removed.can_start());
    }
}
