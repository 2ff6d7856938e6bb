//! Registry credentials.
//!
//! Stored per registry at `<root>/auth/credentials.json`, written atomically.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use dockling_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::fs::{read_json, write_json};

pub const USERNAME_ENV: &str = "DOCKLING_REGISTRY_USERNAME";
pub const PASSWORD_ENV: &str = "DOCKLING_REGISTRY_PASSWORD";

/// Credentials for one registry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialFile {
    registries: BTreeMap<String, Credential>,
}

/// Persistent credential store.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under an engine root directory.
    pub fn under_root(root: &Path) -> Self {
        Self::new(root.join("auth").join("credentials.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save credentials for a registry, replacing any existing entry.
    pub fn store(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut file = self.load()?;
        file.registries.insert(
            normalize_registry(registry),
            Credential {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        write_json(&self.path, &file)
    }

    pub fn get(&self, registry: &str) -> Result<Option<Credential>> {
        Ok(self.load()?.registries.remove(&normalize_registry(registry)))
    }

    /// Remove credentials. Returns whether an entry existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut file = self.load()?;
        let removed = file.registries.remove(&normalize_registry(registry)).is_some();
        if removed {
            write_json(&self.path, &file)?;
        }
        Ok(removed)
    }

    pub fn registries(&self) -> Result<Vec<String>> {
        Ok(self.load()?.registries.into_keys().collect())
    }

    fn load(&self) -> Result<CredentialFile> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Credentials for `registry`: the store first, then the
    /// `DOCKLING_REGISTRY_USERNAME`/`DOCKLING_REGISTRY_PASSWORD` environment,
    /// otherwise anonymous (`None`).
    pub fn resolve(&self, registry: &str) -> Option<Credential> {
        match self.get(registry) {
            Ok(Some(credential)) => return Some(credential),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "Ignoring unreadable credential store"),
        }
        from_env()
    }
}

fn from_env() -> Option<Credential> {
    let username = std::env::var(USERNAME_ENV).ok()?;
    let password = std::env::var(PASSWORD_ENV).ok()?;
    Some(Credential { username, password })
}

/// `docker.io` and its API host share one entry.
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_ascii_lowercase();
    match r.as_str() {
        "docker.io" | "registry-1.docker.io" | "index.docker.io" => "docker.io".to_string(),
        _ => r,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_get_remove() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::under_root(tmp.path());
        assert!(store.get("ghcr.io").unwrap().is_none());

        store.store("ghcr.io", "alice", "s3cret").unwrap();
        store.store("registry-1.docker.io", "bob", "hunter2").unwrap();
        assert_eq!(store.get("GHCR.io").unwrap().unwrap().username, "alice");
        assert_eq!(store.get("docker.io").unwrap().unwrap().username, "bob");
        assert_eq!(store.registries().unwrap(), vec!["docker.io", "ghcr.io"]);

        assert!(store.remove("ghcr.io").unwrap());
        assert!(!store.remove("ghcr.io").unwrap());
        assert!(tmp.path().join("auth/credentials.json").exists());
    }

    #[test]
    fn test_debug_redacts_password() {
        let credential = Credential {
            username: "alice".into(),
            password: "s3cret".into(),
        };
        let shown = format!("{:?}", credential);
        assert!(shown.contains("alice"));
        assert!(!shown.contains("s3cret"));
    }
}
