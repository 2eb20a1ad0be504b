//! Daemon-backed images.
//!
//! The handle keeps the daemon's inspect view plus the layer list and edits
//! them copy-on-write. Saving loads the image into the daemon under the
//! primary name and tags it with the rest. The daemon always stores the
//! Docker dialect.

pub mod daemon;
pub mod memory;

use std::any::Any;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::error::{ImageError, Result};

pub use daemon::{DaemonClient, DaemonLayerSource, ImageArchive, ImageInspect, InspectRootFs};
pub use memory::MemoryDaemon;

use crate::identity::{config_hash, Identifier};
use crate::image::{same_family, Image};
use crate::layer::{self, Layer};
use crate::media::{self, MediaTypes};
use crate::model::{align_history, normalized_date_time, ConfigFile, History, Platform};
use crate::mutate::ConfigEdit;
use crate::rebase::{self, LayerRange};
use crate::save;

/// Construction options for [`LocalImage`].
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    base_image: Option<String>,
    previous_image: Option<String>,
    platform: Option<Platform>,
    created_at: Option<DateTime<Utc>>,
}

impl LocalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_base_image(mut self, name: impl Into<String>) -> Self {
        self.base_image = Some(name.into());
        self
    }

    pub fn with_previous_image(mut self, name: impl Into<String>) -> Self {
        self.previous_image = Some(name.into());
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Immutable snapshot of a local image.
#[derive(Debug, Clone)]
struct LocalState {
    inspect: ImageInspect,
    history: Vec<History>,
    layers: Vec<Arc<Layer>>,
}

impl LocalState {
    fn empty(platform: &Platform) -> Self {
        Self {
            inspect: ImageInspect {
                architecture: platform.architecture.clone(),
                os: platform.os.clone(),
                os_version: platform.os_version.clone(),
                variant: platform.variant.clone(),
                ..Default::default()
            },
            history: Vec::new(),
            layers: Vec::new(),
        }
    }

    fn config(&self) -> ConfigFile {
        self.inspect.to_config(self.history.clone())
    }

    /// Copy with the daemon ID dropped, since the content no longer matches it.
    fn edited(&self) -> Self {
        let mut next = self.clone();
        next.inspect.id.clear();
        next
    }
}

/// An image stored in a local container-engine daemon.
pub struct LocalImage {
    repo_name: String,
    state: Arc<LocalState>,
    previous_layers: Arc<Vec<Arc<Layer>>>,
    created_at: DateTime<Utc>,
    daemon: Arc<dyn DaemonClient>,
}

impl LocalImage {
    /// Open `repo_name` for building.
    ///
    /// A missing base image yields an empty image for the requested platform.
    pub fn new(repo_name: &str, daemon: Arc<dyn DaemonClient>, options: LocalOptions) -> Result<Self> {
        let platform = options.platform.unwrap_or_else(Platform::linux_amd64);

        let state = match &options.base_image {
            Some(name) => Self::read(&daemon, name)?.unwrap_or_else(|| {
                tracing::debug!(base = %name, "Base image not found, starting empty");
                LocalState::empty(&platform)
            }),
            None => LocalState::empty(&platform),
        };
        let previous_layers = match &options.previous_image {
            Some(name) => Self::read(&daemon, name)?
                .map(|previous| previous.layers)
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Self {
            repo_name: repo_name.to_string(),
            state: Arc::new(state),
            previous_layers: Arc::new(previous_layers),
            created_at: options.created_at.unwrap_or_else(normalized_date_time),
            daemon,
        })
    }

    fn read(daemon: &Arc<dyn DaemonClient>, name: &str) -> Result<Option<LocalState>> {
        let Some(inspect) = daemon.inspect(name)? else {
            return Ok(None);
        };
        let history = daemon
            .history(&inspect.id)
            .map_err(|e| ImageError::ConfigUnavailable {
                image: name.to_string(),
                message: e.to_string(),
            })?;
        let layers = daemon::daemon_layers(daemon, &inspect);
        Ok(Some(LocalState {
            inspect,
            history,
            layers,
        }))
    }

    fn install(&mut self, state: LocalState) {
        self.state = Arc::new(state);
    }

    fn append(&mut self, layer: Arc<Layer>) {
        let mut next = self.state.edited();
        next.history = align_history(&next.history, next.layers.len(), self.created_at);
        next.history.push(History::created_at(self.created_at));
        next.inspect.root_fs.layers.push(layer.diff_id.clone());
        tracing::debug!(image = %self.repo_name, diff_id = %layer.diff_id, "Added layer");
        next.layers.push(layer);
        self.install(next);
    }

    fn docker_layer(layer: Layer) -> Result<Arc<Layer>> {
        let media_type = media::convert_layer_type(&layer.media_type, MediaTypes::Docker)?;
        Ok(Arc::new(layer.with_media_type(media_type)))
    }
}

impl Image for LocalImage {
    fn name(&self) -> &str {
        &self.repo_name
    }

    fn rename(&mut self, name: &str) {
        self.repo_name = name.to_string();
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn config_file(&self) -> Result<Arc<ConfigFile>> {
        Ok(Arc::new(self.state.config()))
    }

    fn apply_edit(&mut self, edit: ConfigEdit) -> Result<()> {
        let mut next = self.state.edited();
        let inspect = &mut next.inspect;
        match &edit {
            ConfigEdit::Architecture(value) => inspect.architecture = value.clone(),
            ConfigEdit::Os(value) => inspect.os = value.clone(),
            ConfigEdit::OsVersion(value) => inspect.os_version = value.clone(),
            ConfigEdit::Variant(value) => inspect.variant = value.clone(),
            container_edit => {
                let ignore_case = inspect.os.eq_ignore_ascii_case("windows");
                container_edit.apply_container(&mut inspect.config, ignore_case);
            }
        }
        tracing::debug!(image = %self.repo_name, field = edit.field(), "Updated config");
        self.install(next);
        Ok(())
    }

    fn found(&self) -> bool {
        matches!(self.daemon.inspect(&self.repo_name), Ok(Some(_)))
    }

    /// The daemon only holds images it has validated on load.
    fn valid(&self) -> bool {
        self.found()
    }

    fn identifier(&self) -> Result<Identifier> {
        if !self.state.inspect.id.is_empty() {
            return Ok(Identifier::ImageId(self.state.inspect.id.clone()));
        }
        Ok(Identifier::ImageId(config_hash(&self.state.config())?))
    }

    fn manifest_size(&self) -> Result<i64> {
        Err(ImageError::NotImplemented {
            operation: "ManifestSize",
            backend: "local",
        })
    }

    fn top_layer(&self) -> Result<String> {
        self.state
            .layers
            .last()
            .map(|layer| layer.diff_id.clone())
            .ok_or_else(|| ImageError::MissingRequiredField {
                image: self.repo_name.clone(),
                field: "layers",
            })
    }

    fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        layer::find(&self.state.layers, diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.repo_name.clone(),
                diff_id: diff_id.to_string(),
            })?
            .uncompressed_reader()
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        let layer = Self::docker_layer(Layer::from_file(path)?)?;
        self.append(layer);
        Ok(())
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        let layer = Self::docker_layer(Layer::from_file_with_diff_id(path, diff_id)?)?;
        self.append(layer);
        Ok(())
    }

    fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let layer = layer::find(&self.previous_layers, diff_id)
            .cloned()
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.repo_name.clone(),
                diff_id: diff_id.to_string(),
            })?;
        self.append(layer);
        Ok(())
    }

    fn rebase(&mut self, top_diff_id: &str, new_base: &dyn Image) -> Result<()> {
        let base = same_family::<LocalImage>(&self.repo_name, "local", new_base)?;
        let own = &self.state;
        let range =
            LayerRange::require(&own.inspect.root_fs.layers, top_diff_id, &self.repo_name)?;

        let mut next = own.edited();
        next.layers = rebase::splice(&own.layers, range, &base.state.layers);
        next.inspect.root_fs.layers = rebase::splice(
            &own.inspect.root_fs.layers,
            range,
            &base.state.inspect.root_fs.layers,
        );
        next.history = rebase::splice(
            &align_history(&own.history, own.layers.len(), self.created_at),
            range,
            &align_history(&base.state.history, base.state.layers.len(), self.created_at),
        );
        next.inspect.architecture = base.state.inspect.architecture.clone();
        next.inspect.os = base.state.inspect.os.clone();
        next.inspect.os_version = base.state.inspect.os_version.clone();

        tracing::debug!(image = %self.repo_name, base = %base.repo_name, "Rebased image");
        self.install(next);
        Ok(())
    }

    fn annotate_ref_name(&mut self, _ref_name: &str) -> Result<()> {
        Err(ImageError::NotImplemented {
            operation: "AnnotateRefName",
            backend: "local",
        })
    }

    fn get_annotate_ref_name(&self) -> Result<String> {
        Err(ImageError::NotImplemented {
            operation: "GetAnnotateRefName",
            backend: "local",
        })
    }

    fn save_as(&mut self, name: &str, additional: &[&str]) -> Result<()> {
        let config = save::prepare_config(&self.state.config(), self.created_at);
        let mut next = self.state.edited();
        next.inspect = ImageInspect::from_config("", Vec::new(), &config);
        next.history = config.history.clone();
        self.install(next);

        let mut loaded: Option<String> = None;
        let mut load_failure: Option<String> = None;
        let result = save::save_each(&save::destinations(name, additional), |destination| {
            if let Some(id) = &loaded {
                return self.daemon.tag(id, destination);
            }
            if let Some(cause) = &load_failure {
                return Err(ImageError::Daemon(format!("image was not loaded: {}", cause)));
            }
            let archive = ImageArchive {
                repo_tag: destination.to_string(),
                config: config.clone(),
                layers: self.state.layers.clone(),
            };
            match self.daemon.load(archive) {
                Ok(id) => {
                    tracing::info!(image = %destination, image_id = %id, "Loaded image into daemon");
                    loaded = Some(id);
                    Ok(())
                }
                Err(e) => {
                    load_failure = Some(e.to_string());
                    Err(e)
                }
            }
        });

        if let Some(id) = loaded {
            let mut next = self.state.as_ref().clone();
            next.inspect.id = id;
            self.install(next);
        }
        result
    }

    fn delete(&mut self) -> Result<()> {
        self.daemon.remove(&self.repo_name)?;
        tracing::info!(image = %self.repo_name, "Removed image from daemon");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::tests::write_test_layer;
    use tempfile::TempDir;

    fn open(daemon: &Arc<MemoryDaemon>, name: &str, options: LocalOptions) -> LocalImage {
        LocalImage::new(name, Arc::clone(daemon) as Arc<dyn DaemonClient>, options).unwrap()
    }

    fn layer_file(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        write_test_layer(&path, &[(name, name.as_bytes())], true);
        path
    }

    #[test]
    fn test_fresh_image() {
        let daemon = Arc::new(MemoryDaemon::new());
        let image = open(&daemon, "app", LocalOptions::new());
        assert!(!image.found());
        assert_eq!(image.os().unwrap(), "linux");
        assert!(image.top_layer().is_err());
        assert!(matches!(
            image.manifest_size(),
            Err(ImageError::NotImplemented { .. })
        ));
    }

    #[test]
    fn test_save_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        let mut image = open(&daemon, "app", LocalOptions::new());
        image.add_layer(&layer_file(&tmp, "a")).unwrap();
        image.set_env("MODE", "prod").unwrap();
        image.save(&["app:v1"]).unwrap();

        assert!(image.found());
        assert!(image.valid());
        let id = image.identifier().unwrap();
        assert_eq!(
            daemon.inspect("app:v1").unwrap().unwrap().id,
            id.digest()
        );

        let reopened = open(&daemon, "next", LocalOptions::new().from_base_image("app"));
        assert_eq!(reopened.env("MODE").unwrap(), "prod");
        assert_eq!(reopened.top_layer().unwrap(), image.top_layer().unwrap());
        assert_eq!(reopened.identifier().unwrap(), id);

        let mut archive = tar::Archive::new(reopened.get_layer(&image.top_layer().unwrap()).unwrap());
        assert_eq!(archive.entries().unwrap().count(), 1);
    }

    #[test]
    fn test_identifier_falls_back_to_config_hash() {
        let daemon = Arc::new(MemoryDaemon::new());
        let mut image = open(&daemon, "app", LocalOptions::new());
        let before = image.identifier().unwrap();
        image.set_label("a", "b").unwrap();
        let after = image.identifier().unwrap();
        assert_ne!(before, after);
        assert_eq!(after, Identifier::ImageId(config_hash(&image.config_file().unwrap()).unwrap()));
    }

    #[test]
    fn test_windows_env_is_case_insensitive() {
        let daemon = Arc::new(MemoryDaemon::new());
        let mut image = open(
            &daemon,
            "app",
            LocalOptions::new().with_platform(Platform::new("windows", "amd64")),
        );
        image.set_env("Path", "C:\\a").unwrap();
        image.set_env("PATH", "C:\\b").unwrap();
        assert_eq!(image.env("path").unwrap(), "C:\\b");
        assert_eq!(image.config_file().unwrap().config.env.len(), 1);
    }

    #[test]
    fn test_reuse_layer() {
        let tmp = TempDir::new().unwrap();
        let daemon = Arc::new(MemoryDaemon::new());
        let mut previous = open(&daemon, "app", LocalOptions::new());
        previous.add_layer(&layer_file(&tmp, "a")).unwrap();
        previous.save(&[]).unwrap();
        let diff_id = previous.top_layer().unwrap();

        let mut image = open(&daemon, "app", LocalOptions::new().with_previous_image("app"));
        image.reuse_layer(&diff_id).unwrap();
        assert_eq!(image.top_layer().unwrap(), diff_id);
        assert_eq!(image.config_file().unwrap().history.len(), 1);

        assert!(matches!(
            image.reuse_layer("sha256:doesnotexist"),
            Err(ImageError::LayerNotFound { .. })
        ));
    }

    #[test]
    fn test_failed_load_fails_every_destination() {
        let daemon = Arc::new(MemoryDaemon::new());
        let mut image = open(&daemon, "bad::name", LocalOptions::new());
        match image.save(&["ok/name"]) {
            Err(ImageError::Save(e)) => assert_eq!(e.failed_names(), vec!["bad::name", "ok/name"]),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(daemon.image_count(), 0);
    }

    #[test]
    fn test_annotations_not_implemented() {
        let daemon = Arc::new(MemoryDaemon::new());
        let mut image = open(&daemon, "app", LocalOptions::new());
        assert!(image.annotate_ref_name("x").is_err());
        assert!(image.get_annotate_ref_name().is_err());
    }

    #[test]
    fn test_delete() {
        let daemon = Arc::new(MemoryDaemon::new());
        let mut image = open(&daemon, "app", LocalOptions::new());
        image.save(&[]).unwrap();
        image.delete().unwrap();
        assert!(!image.found());
    }
}
