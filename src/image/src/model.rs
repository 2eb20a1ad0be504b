//! Manifest, index and config JSON shapes shared by the OCI and Docker dialects.
//!
//! Unknown fields are kept in `extra` so configs inherited from a base image
//! round-trip without loss. Maps are `BTreeMap` so serialization is canonical.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Seconds since the Unix epoch of `1980-01-01T00:00:01Z`, the creation time
/// stamped on images when the caller supplies none.
pub const NORMALIZED_EPOCH_SECS: i64 = 315_532_801;

/// The normalized creation time used for reproducible builds.
pub fn normalized_date_time() -> DateTime<Utc> {
    DateTime::from_timestamp(NORMALIZED_EPOCH_SECS, 0).unwrap_or_default()
}

/// Treat an explicit JSON `null` like a missing field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Target platform of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            architecture: architecture.into(),
            ..Default::default()
        }
    }

    /// `linux/amd64`, used when no platform is requested.
    pub fn linux_amd64() -> Self {
        Self::new("linux", "amd64")
    }

    pub fn is_empty(&self) -> bool {
        self.os.is_empty() && self.architecture.is_empty()
    }

    /// Whether `candidate` satisfies this platform. OS and architecture must
    /// match exactly; variant and OS version only when requested.
    pub fn matches(&self, candidate: &Platform) -> bool {
        self.os == candidate.os
            && self.architecture == candidate.architecture
            && (self.variant.is_empty() || self.variant == candidate.variant)
            && (self.os_version.is_empty() || self.os_version == candidate.os_version)
    }
}

/// Content descriptor (manifest, config, layer or index entry).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Image manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    pub config: Descriptor,
    #[serde(default, deserialize_with = "nullable")]
    pub layers: Vec<Descriptor>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Image index (`index.json` of a layout, or a registry manifest list).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,
    #[serde(default, deserialize_with = "nullable")]
    pub manifests: Vec<Descriptor>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// Manifest for `platform`.
    ///
    /// A single-entry index yields its only manifest. Otherwise the first
    /// entry whose platform matches wins; entries without a platform never
    /// match.
    pub fn select(&self, platform: &Platform) -> Option<&Descriptor> {
        if let [only] = self.manifests.as_slice() {
            return Some(only);
        }
        self.manifests.iter().find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|candidate| platform.matches(candidate))
        })
    }
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: crate::media::OCI_INDEX.to_string(),
            manifests: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

/// Root filesystem section of a config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub fs_type: String,
    #[serde(default, deserialize_with = "nullable")]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// One history entry of a config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub comment: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub empty_layer: bool,
}

impl History {
    pub fn created_at(created: DateTime<Utc>) -> Self {
        Self {
            created: Some(created),
            ..Default::default()
        }
    }
}

/// The runtime `config` sub-object. Keys use the Docker/OCI PascalCase names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub working_dir: String,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ContainerConfig {
    /// Value of environment variable `key`, if present.
    pub fn env_var(&self, key: &str, ignore_case: bool) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            let (name, value) = split_env(entry);
            env_key_eq(name, key, ignore_case).then_some(value)
        })
    }

    /// Set `key=value`, replacing an existing entry in its slot or appending.
    pub fn set_env(&mut self, key: &str, value: &str, ignore_case: bool) {
        let entry = format!("{}={}", key, value);
        match self
            .env
            .iter()
            .position(|existing| env_key_eq(split_env(existing).0, key, ignore_case))
        {
            Some(idx) => self.env[idx] = entry,
            None => self.env.push(entry),
        }
    }
}

fn split_env(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

fn env_key_eq(found: &str, wanted: &str, ignore_case: bool) -> bool {
    if ignore_case {
        found.eq_ignore_ascii_case(wanted)
    } else {
        found == wanted
    }
}

/// `history` reduced to one entry per layer: empty-layer entries dropped,
/// surplus entries truncated, missing ones stamped `created`.
pub fn align_history(history: &[History], layer_count: usize, created: DateTime<Utc>) -> Vec<History> {
    let mut aligned: Vec<History> = history
        .iter()
        .filter(|entry| !entry.empty_layer)
        .take(layer_count)
        .cloned()
        .collect();
    aligned.resize_with(layer_count, || History::created_at(created));
    aligned
}

/// Image configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub architecture: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub docker_version: String,
    #[serde(default, deserialize_with = "nullable", skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub rootfs: RootFs,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(rename = "os.version", default, skip_serializing_if = "String::is_empty")]
    pub os_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub variant: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ConfigFile {
    /// Empty config for `platform` with no layers.
    pub fn for_platform(platform: &Platform) -> Self {
        Self {
            architecture: platform.architecture.clone(),
            os: platform.os.clone(),
            os_version: platform.os_version.clone(),
            variant: platform.variant.clone(),
            ..Default::default()
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            os_version: self.os_version.clone(),
            variant: self.variant.clone(),
        }
    }

    /// Whether env lookups ignore case for this image's OS.
    pub fn env_ignores_case(&self) -> bool {
        self.os.eq_ignore_ascii_case("windows")
    }

    /// History with exactly one entry per layer.
    pub fn layer_history(&self, created: DateTime<Utc>) -> Vec<History> {
        align_history(&self.history, self.rootfs.diff_ids.len(), created)
    }

    /// Append a layer's diff ID with a matching history entry.
    pub fn push_layer(&mut self, diff_id: &str, created: DateTime<Utc>) {
        self.history = self.layer_history(created);
        self.rootfs.diff_ids.push(diff_id.to_string());
        self.history.push(History::created_at(created));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_date_time() {
        assert_eq!(
            normalized_date_time().to_rfc3339(),
            "1980-01-01T00:00:01+00:00"
        );
    }

    #[test]
    fn test_config_file_parses_docker_nulls() {
        let json = r#"{
            "architecture": "amd64",
            "os": "linux",
            "container": "abc123",
            "docker_version": "24.0.7",
            "config": {"Env": null, "Labels": null, "Cmd": ["sh"], "Volumes": {"/data": {}}},
            "rootfs": {"type": "layers", "diff_ids": ["sha256:aaa"]},
            "history": [{"created": "2024-01-02T03:04:05.123456789Z", "created_by": "ADD file"}]
        }"#;
        let config: ConfigFile = serde_json::from_str(json).unwrap();
        assert!(config.config.env.is_empty());
        assert!(config.config.labels.is_empty());
        assert_eq!(config.config.cmd, vec!["sh"]);
        assert!(config.config.extra.contains_key("Volumes"));
        assert_eq!(config.docker_version, "24.0.7");
        assert_eq!(config.history.len(), 1);
    }

    #[test]
    fn test_config_file_serializes_os_version_key() {
        let mut config = ConfigFile::for_platform(&Platform::new("windows", "amd64"));
        config.os_version = "10.0.17763.1040".to_string();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["os.version"], "10.0.17763.1040");
        assert!(json.get("docker_version").is_none());
        assert!(json.get("container").is_none());
    }

    #[test]
    fn test_set_env_replaces_in_place() {
        let mut config = ContainerConfig::default();
        config.set_env("A", "1", false);
        config.set_env("B", "2", false);
        config.set_env("A", "3", false);
        assert_eq!(config.env, vec!["A=3", "B=2"]);
    }

    #[test]
    fn test_set_env_case_sensitivity() {
        let mut config = ContainerConfig::default();
        config.set_env("Path", "/bin", false);
        config.set_env("PATH", "/usr/bin", false);
        assert_eq!(config.env.len(), 2);

        let mut config = ContainerConfig::default();
        config.set_env("Path", "/bin", true);
        config.set_env("PATH", "/usr/bin", true);
        assert_eq!(config.env, vec!["PATH=/usr/bin"]);
        assert_eq!(config.env_var("path", true), Some("/usr/bin"));
        assert_eq!(config.env_var("path", false), None);
    }

    #[test]
    fn test_env_var_keeps_equals_in_value() {
        let config = ContainerConfig {
            env: vec!["OPTS=a=b".to_string()],
            ..Default::default()
        };
        assert_eq!(config.env_var("OPTS", false), Some("a=b"));
    }

    #[test]
    fn test_push_layer_aligns_history() {
        let created = normalized_date_time();
        let mut config = ConfigFile::default();
        config.rootfs.diff_ids = vec!["sha256:a".to_string()];
        config.history = vec![
            History {
                created_by: "ENV X=1".to_string(),
                empty_layer: true,
                ..Default::default()
            },
            History {
                created_by: "ADD base".to_string(),
                ..Default::default()
            },
        ];

        config.push_layer("sha256:b", created);

        assert_eq!(config.rootfs.diff_ids, vec!["sha256:a", "sha256:b"]);
        assert_eq!(config.history.len(), 2);
        assert_eq!(config.history[0].created_by, "ADD base");
        assert_eq!(config.history[1].created, Some(created));
    }

    #[test]
    fn test_platform_matches() {
        let want = Platform::new("linux", "arm64");
        let mut candidate = Platform::new("linux", "arm64");
        candidate.variant = "v8".to_string();
        assert!(want.matches(&candidate));
        assert!(!want.matches(&Platform::new("linux", "amd64")));

        let mut want_variant = want.clone();
        want_variant.variant = "v7".to_string();
        assert!(!want_variant.matches(&candidate));
    }

    #[test]
    fn test_index_select() {
        let entry = |digest: &str, platform: Option<Platform>| Descriptor {
            media_type: crate::media::OCI_MANIFEST.to_string(),
            digest: digest.to_string(),
            size: 1,
            platform,
            ..Default::default()
        };

        let single = ImageIndex {
            manifests: vec![entry("sha256:only", None)],
            ..Default::default()
        };
        assert_eq!(
            single.select(&Platform::new("windows", "arm64")).unwrap().digest,
            "sha256:only"
        );

        let multi = ImageIndex {
            manifests: vec![
                entry("sha256:amd", Some(Platform::new("linux", "amd64"))),
                entry("sha256:arm", Some(Platform::new("linux", "arm64"))),
                entry("sha256:arm2", Some(Platform::new("linux", "arm64"))),
            ],
            ..Default::default()
        };
        assert_eq!(
            multi.select(&Platform::new("linux", "arm64")).unwrap().digest,
            "sha256:arm"
        );
        assert!(multi.select(&Platform::new("windows", "amd64")).is_none());
        assert!(ImageIndex::default().select(&Platform::linux_amd64()).is_none());
    }

    #[test]
    fn test_index_default_is_oci() {
        let index = ImageIndex::default();
        assert_eq!(index.schema_version, 2);
        assert_eq!(index.media_type, crate::media::OCI_INDEX);
        assert!(index.manifests.is_empty());
    }
}
