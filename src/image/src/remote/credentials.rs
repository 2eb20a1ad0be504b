//! Registry credentials.
//!
//! Logins are kept in a JSON file (`~/.imgkit/auth/credentials.json` by
//! default) keyed by registry host. Lookups fall back to the
//! `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` environment variables, then to
//! anonymous access.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use imgkit_core::error::{ImageError, Result};
use serde::{Deserialize, Serialize};

/// Credentials presented to one registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    basic: Option<(String, String)>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            basic: Some((username.into(), password.into())),
        }
    }

    /// `REGISTRY_USERNAME`/`REGISTRY_PASSWORD` when both are set.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("REGISTRY_USERNAME").ok()?;
        let password = std::env::var("REGISTRY_PASSWORD").ok()?;
        Some(Self::basic(username, password))
    }

    /// Credentials for `registry`: the store first, then the environment,
    /// then anonymous. An unreadable store is logged and skipped.
    pub fn resolve(registry: &str, store: Option<&CredentialStore>) -> Self {
        if let Some(store) = store {
            match store.lookup(registry) {
                Ok(Some(auth)) => return auth,
                Ok(None) => {}
                Err(e) => tracing::warn!(registry = %registry, error = %e, "Ignoring credential store"),
            }
        }
        Self::from_env().unwrap_or_default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.basic.is_none()
    }

    /// `(username, password)` for basic auth.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.basic
            .as_ref()
            .map(|(user, pass)| (user.as_str(), pass.as_str()))
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.basic {
            Some((user, _)) => write!(f, "RegistryAuth::Basic({}, <redacted>)", user),
            None => write!(f, "RegistryAuth::Anonymous"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Login {
    username: String,
    password: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Logins {
    #[serde(default)]
    registries: BTreeMap<String, Login>,
}

/// JSON file of per-registry logins.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `~/.imgkit/auth/credentials.json`.
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            ImageError::Config("cannot locate home directory for credential store".to_string())
        })?;
        Ok(Self::new(home.join(".imgkit").join("auth").join("credentials.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save a login, replacing any previous one for the registry.
    pub fn insert(&self, registry: &str, username: &str, password: &str) -> Result<()> {
        let mut logins = self.read()?;
        logins.registries.insert(
            registry_key(registry),
            Login {
                username: username.to_string(),
                password: password.to_string(),
            },
        );
        self.write(&logins)
    }

    pub fn lookup(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        Ok(self
            .read()?
            .registries
            .get(&registry_key(registry))
            .map(|login| RegistryAuth::basic(&login.username, &login.password)))
    }

    /// Forget a registry's login. Returns whether one existed.
    pub fn remove(&self, registry: &str) -> Result<bool> {
        let mut logins = self.read()?;
        if logins.registries.remove(&registry_key(registry)).is_none() {
            return Ok(false);
        }
        self.write(&logins)?;
        Ok(true)
    }

    /// Registries with a saved login, sorted.
    pub fn registries(&self) -> Result<Vec<String>> {
        Ok(self.read()?.registries.into_keys().collect())
    }

    fn read(&self) -> Result<Logins> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                ImageError::Config(format!(
                    "credential store {} is corrupt: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Logins::default()),
            Err(e) => Err(ImageError::Config(format!(
                "cannot read credential store {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    /// Replace the file through a temporary sibling so readers never see a
    /// partial write.
    fn write(&self, logins: &Logins) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(logins)?)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

/// Docker Hub is reachable under several names; store them under one key.
fn registry_key(registry: &str) -> String {
    match registry.trim().to_ascii_lowercase().as_str() {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}
