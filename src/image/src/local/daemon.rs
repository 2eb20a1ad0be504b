//! Container-engine daemon client interface and its native image shape.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::layer::{BlobSource, Layer};
use crate::media;
use crate::model::{ConfigFile, ContainerConfig, Descriptor, History, RootFs};

/// `RootFS` section of an inspect response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectRootFs {
    #[serde(rename = "Type")]
    pub fs_type: String,
    #[serde(default)]
    pub layers: Vec<String>,
}

impl Default for InspectRootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            layers: Vec::new(),
        }
    }
}

/// Image as reported by the daemon's inspect call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageInspect {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub docker_version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default)]
    pub variant: String,
    #[serde(default)]
    pub config: ContainerConfig,
    #[serde(rename = "RootFS", default)]
    pub root_fs: InspectRootFs,
    /// Top-level config fields inspect output has no slot for. Daemons that
    /// keep the original config (such as [`MemoryDaemon`](super::MemoryDaemon))
    /// fill this so they reach the config unchanged.
    #[serde(skip)]
    pub config_extra: BTreeMap<String, serde_json::Value>,
}

impl ImageInspect {
    /// Inspect view of a config, as the daemon reports it after a load.
    pub fn from_config(id: &str, repo_tags: Vec<String>, config: &ConfigFile) -> Self {
        Self {
            id: id.to_string(),
            repo_tags,
            created: config.created,
            author: config.author.clone(),
            container: config.container.clone(),
            docker_version: config.docker_version.clone(),
            architecture: config.architecture.clone(),
            os: config.os.clone(),
            os_version: config.os_version.clone(),
            variant: config.variant.clone(),
            config: config.config.clone(),
            root_fs: InspectRootFs {
                fs_type: config.rootfs.fs_type.clone(),
                layers: config.rootfs.diff_ids.clone(),
            },
            config_extra: config.extra.clone(),
        }
    }

    /// The config file this inspect view describes.
    pub fn to_config(&self, history: Vec<History>) -> ConfigFile {
        ConfigFile {
            architecture: self.architecture.clone(),
            author: self.author.clone(),
            container: self.container.clone(),
            created: self.created,
            docker_version: self.docker_version.clone(),
            history,
            os: self.os.clone(),
            rootfs: RootFs {
                fs_type: self.root_fs.fs_type.clone(),
                diff_ids: self.root_fs.layers.clone(),
            },
            config: self.config.clone(),
            os_version: self.os_version.clone(),
            variant: self.variant.clone(),
            extra: self.config_extra.clone(),
        }
    }
}

/// An image handed to the daemon for loading.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    /// Name to tag the loaded image with
    pub repo_tag: String,
    pub config: ConfigFile,
    pub layers: Vec<Arc<Layer>>,
}

/// Daemon RPCs used by the local backend, keyed by image reference or ID.
pub trait DaemonClient: Send + Sync {
    /// `None` when the daemon has no such image.
    fn inspect(&self, reference: &str) -> Result<Option<ImageInspect>>;

    fn history(&self, reference: &str) -> Result<Vec<History>>;

    /// Load an image and tag it; returns the image ID.
    fn load(&self, archive: ImageArchive) -> Result<String>;

    fn tag(&self, image_id: &str, reference: &str) -> Result<()>;

    fn remove(&self, reference: &str) -> Result<()>;

    /// Uncompressed tar of one layer of a stored image.
    fn layer_blob(&self, image_id: &str, diff_id: &str) -> Result<Vec<u8>>;
}

/// Reads one layer of a daemon image on demand.
pub struct DaemonLayerSource {
    daemon: Arc<dyn DaemonClient>,
    image_id: String,
    diff_id: String,
}

impl fmt::Debug for DaemonLayerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonLayerSource")
            .field("image_id", &self.image_id)
            .field("diff_id", &self.diff_id)
            .finish()
    }
}

impl BlobSource for DaemonLayerSource {
    fn fetch(&self, _digest: &str) -> Result<Vec<u8>> {
        self.daemon.layer_blob(&self.image_id, &self.diff_id)
    }
}

/// Layers of a stored image, read lazily from the daemon.
///
/// Daemon layers are uncompressed, so the digest equals the diff ID.
pub fn daemon_layers(daemon: &Arc<dyn DaemonClient>, inspect: &ImageInspect) -> Vec<Arc<Layer>> {
    inspect
        .root_fs
        .layers
        .iter()
        .map(|diff_id| {
            let descriptor = Descriptor {
                media_type: media::DOCKER_LAYER.to_string(),
                digest: diff_id.clone(),
                ..Default::default()
            };
            let source = Arc::new(DaemonLayerSource {
                daemon: Arc::clone(daemon),
                image_id: inspect.id.clone(),
                diff_id: diff_id.clone(),
            });
            Arc::new(Layer::from_source(&descriptor, diff_id, source))
        })
        .collect()
}
