//! Registry connection settings.
//!
//! Settings are keyed by registry host (`host[:port]`) and handed to image
//! backends at construction time.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{ImageError, Result};

/// Connection flags for one registry host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySetting {
    /// Talk plain HTTP to this registry
    #[serde(default)]
    pub insecure: bool,

    /// Use HTTPS but skip certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Per-host registry settings.
///
/// ```yaml
/// registries:
///   localhost:5000:
///     insecure: true
///   registry.internal:
///     insecure_skip_verify: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySettings {
    #[serde(default)]
    registries: HashMap<String, RegistrySetting>,
}

impl RegistrySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, host: impl Into<String>, setting: RegistrySetting) -> Self {
        self.insert(host, setting);
        self
    }

    pub fn insert(&mut self, host: impl Into<String>, setting: RegistrySetting) {
        self.registries.insert(host.into(), setting);
    }

    /// Settings for a host; hosts without an entry get secure defaults.
    pub fn get(&self, host: &str) -> RegistrySetting {
        self.registries.get(host).copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }

    /// Parse settings from a YAML document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Load settings from a YAML or JSON file (chosen by extension).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ImageError::Config(format!(
                "Failed to read registry settings {}: {}",
                path.display(),
                e
            ))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(serde_json::from_str(&content)?),
            _ => Self::from_yaml_str(&content),
        }
    }
}
