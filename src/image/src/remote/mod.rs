//! Registry-backed images.
//!
//! A [`RemoteImage`] holds its manifest-level value in memory and talks to the
//! registry only to read the base/previous images, to check existence and access, and to push.

pub mod credentials;
pub mod memory;
pub mod transport;

use std::any::Any;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::config::RegistrySettings;
use imgkit_core::error::{ImageError, Result};

pub use credentials::{CredentialStore, RegistryAuth};
pub use memory::MemoryRegistry;
pub use transport::{
    ImageUpload, ManifestResponse, OciDistributionTransport, RegistryAccess, RegistryBlobSource,
    RegistryTransport,
};

use crate::identity::Identifier;
use crate::image::{same_family, Image};
use crate::layer::{self, Layer};
use crate::media::{self, MediaTypes};
use crate::model::{normalized_date_time, ConfigFile, ImageIndex, Manifest, Platform};
use crate::mutate::ConfigEdit;
use crate::rebase;
use crate::reference::ImageReference;
use crate::save;
use crate::validate;
use crate::value::ImageValue;

/// Attempts for idempotent read-only checks.
const MAX_RETRIES: usize = 2;

/// Retry `op` on failures other than refused access.
fn with_retries<T>(what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if attempt < MAX_RETRIES && !e.is_access_denied() => {
                tracing::debug!(operation = %what, attempt, error = %e, "Retrying registry check");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Construction options for [`RemoteImage`].
#[derive(Debug, Clone, Default)]
pub struct RemoteOptions {
    base_image: Option<String>,
    previous_image: Option<String>,
    platform: Option<Platform>,
    created_at: Option<DateTime<Utc>>,
    media_types: MediaTypes,
    registry_settings: RegistrySettings,
    credentials: Option<CredentialStore>,
}

impl RemoteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing image instead of an empty one.
    pub fn from_base_image(mut self, name: impl Into<String>) -> Self {
        self.base_image = Some(name.into());
        self
    }

    /// Image whose layers [`Image::reuse_layer`] may pick from.
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

    pub fn with_media_types(mut self, media_types: MediaTypes) -> Self {
        self.media_types = media_types;
        self
    }

    pub fn with_registry_settings(mut self, settings: RegistrySettings) -> Self {
        self.registry_settings = settings;
        self
    }

    pub fn with_credential_store(mut self, store: CredentialStore) -> Self {
        self.credentials = Some(store);
        self
    }
}

/// Registry connection context shared by a handle and the layers it reads.
#[derive(Clone)]
struct Registry {
    transport: Arc<dyn RegistryTransport>,
    settings: RegistrySettings,
    credentials: Option<CredentialStore>,
}

impl Registry {
    fn access(&self, reference: &ImageReference) -> RegistryAccess {
        RegistryAccess {
            auth: RegistryAuth::resolve(&reference.registry, self.credentials.as_ref()),
            setting: self.settings.get(&reference.registry),
        }
    }

    /// Read `name` for `platform`; `None` when the registry has no such image.
    fn fetch(&self, name: &str, platform: &Platform) -> Result<Option<ImageValue>> {
        let reference = ImageReference::parse(name)?;
        let access = self.access(&reference);

        let Some(mut response) = self.transport.get(&reference, &access)? else {
            return Ok(None);
        };
        if response.is_index() {
            let index: ImageIndex = serde_json::from_slice(&response.raw)?;
            let entry = index.select(platform).ok_or_else(|| ImageError::Registry {
                registry: reference.registry.clone(),
                message: format!(
                    "{} has no manifest for platform {}/{}",
                    name, platform.os, platform.architecture
                ),
            })?;
            let pinned = reference.with_digest(&entry.digest);
            response = self
                .transport
                .get(&pinned, &access)?
                .ok_or_else(|| ImageError::Registry {
                    registry: reference.registry.clone(),
                    message: format!("manifest {} listed in index is missing", entry.digest),
                })?;
        }

        let manifest: Manifest = serde_json::from_slice(&response.raw)?;
        let unavailable = |message: String| ImageError::ConfigUnavailable {
            image: name.to_string(),
            message,
        };
        let raw_config = self
            .transport
            .fetch_blob(&reference, &access, &manifest.config)
            .map_err(|e| unavailable(e.to_string()))?;
        let config: ConfigFile =
            serde_json::from_slice(&raw_config).map_err(|e| unavailable(e.to_string()))?;

        let source: Arc<dyn layer::BlobSource> = Arc::new(RegistryBlobSource::new(
            Arc::clone(&self.transport),
            reference.clone(),
            access,
        ));
        let layers = manifest
            .layers
            .iter()
            .zip(&config.rootfs.diff_ids)
            .map(|(descriptor, diff_id)| {
                Arc::new(Layer::from_source(descriptor, diff_id, Arc::clone(&source)))
            })
            .collect();

        let manifest_type = if manifest.media_type.is_empty() {
            media::DOCKER_MANIFEST
        } else {
            manifest.media_type.as_str()
        };
        tracing::debug!(image = %name, digest = %response.digest, "Read image from registry");
        ImageValue::from_parts(manifest_type, &manifest.config.media_type, config, layers).map(Some)
    }
}

/// An image stored in a container registry.
pub struct RemoteImage {
    repo_name: String,
    value: Arc<ImageValue>,
    previous_layers: Arc<Vec<Arc<Layer>>>,
    created_at: DateTime<Utc>,
    media_types: MediaTypes,
    registry: Registry,
}

impl RemoteImage {
    /// Open `repo_name` for building.
    ///
    /// A missing base image yields an empty image for the requested platform.
    pub fn new(
        repo_name: &str,
        transport: Arc<dyn RegistryTransport>,
        options: RemoteOptions,
    ) -> Result<Self> {
        let platform = options.platform.unwrap_or_else(Platform::linux_amd64);
        let registry = Registry {
            transport,
            settings: options.registry_settings,
            credentials: options.credentials,
        };

        let base = match &options.base_image {
            Some(name) => {
                let found = registry.fetch(name, &platform)?;
                if found.is_none() {
                    tracing::debug!(base = %name, "Base image not found, starting empty");
                }
                found
            }
            None => None,
        };
        let media_types = options
            .media_types
            .or(base.as_ref().map_or(MediaTypes::Docker, ImageValue::media_types))
            .or(MediaTypes::Docker);
        let value = match base {
            Some(base) => media::normalize(&base, media_types)?,
            None => ImageValue::empty(&platform, media_types),
        };

        let previous_layers = match &options.previous_image {
            Some(name) => registry
                .fetch(name, &platform)?
                .map(|previous| previous.layers().to_vec())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Self {
            repo_name: repo_name.to_string(),
            value: Arc::new(value),
            previous_layers: Arc::new(previous_layers),
            created_at: options.created_at.unwrap_or_else(normalized_date_time),
            media_types,
            registry,
        })
    }

    fn reference(&self) -> Result<ImageReference> {
        ImageReference::parse(&self.repo_name)
    }

    pub fn media_types(&self) -> MediaTypes {
        self.media_types
    }

    /// Whether the registry lets the current credentials read this repository.
    ///
    /// Only a 401 or 403 counts as no access. Other registry failures say
    /// nothing about the credentials and are logged and treated as readable.
    pub fn check_read_access(&self) -> Result<()> {
        let reference = self.reference()?;
        let access = self.registry.access(&reference);
        match with_retries("check_read_access", || {
            self.registry.transport.head(&reference, &access)
        }) {
            Err(e) if e.is_access_denied() => Err(e),
            Err(e) => {
                tracing::debug!(
                    image = %self.repo_name,
                    error = %e,
                    "Read access check inconclusive, assuming readable"
                );
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    /// Whether the current credentials can both read and push this repository.
    pub fn check_read_write_access(&self) -> Result<()> {
        self.check_read_access()?;
        let reference = self.reference()?;
        let access = self.registry.access(&reference);
        with_retries("check_push_permission", || {
            self.registry
                .transport
                .check_push_permission(&reference, &access)
        })
    }

    fn install(&mut self, value: ImageValue) {
        self.value = Arc::new(value);
    }

    fn upload(&self) -> Result<ImageUpload> {
        let layers = self
            .value
            .layers()
            .iter()
            .map(|layer| layer.compressed())
            .collect::<Result<Vec<_>>>()?;
        Ok(ImageUpload {
            manifest: self.value.manifest()?,
            raw_manifest: self.value.raw_manifest()?,
            config: self.value.config_bytes()?,
            layers,
        })
    }
}

impl Image for RemoteImage {
    fn name(&self) -> &str {
        &self.repo_name
    }

    fn rename(&mut self, name: &str) {
        self.repo_name = name.to_string();
    }

    fn kind(&self) -> &'static str {
        "remote"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn config_file(&self) -> Result<Arc<ConfigFile>> {
        Ok(Arc::clone(self.value.config()))
    }

    fn apply_edit(&mut self, edit: ConfigEdit) -> Result<()> {
        let config = edit.apply(self.value.config());
        tracing::debug!(image = %self.repo_name, field = edit.field(), "Updated config");
        let next = self.value.with_config(config);
        self.install(next);
        Ok(())
    }

    fn found(&self) -> bool {
        let Ok(reference) = self.reference() else {
            return false;
        };
        let access = self.registry.access(&reference);
        matches!(
            with_retries("found", || self.registry.transport.head(&reference, &access)),
            Ok(Some(_))
        )
    }

    fn valid(&self) -> bool {
        let check = || -> Result<()> {
            let reference = self.reference()?;
            let access = self.registry.access(&reference);
            let response = self
                .registry
                .transport
                .get(&reference, &access)?
                .ok_or_else(|| ImageError::ValidationFailed {
                    subject: self.repo_name.clone(),
                    message: "image not found".to_string(),
                })?;
            if response.is_index() {
                return validate::validate_index(&response.raw);
            }
            validate::validate_manifest(&response.raw)?;
            let manifest: Manifest = serde_json::from_slice(&response.raw)?;
            let config = self
                .registry
                .transport
                .fetch_blob(&reference, &access, &manifest.config)?;
            validate::validate_config(&config)
        };
        match check() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(image = %self.repo_name, error = %e, "Image is not valid");
                false
            }
        }
    }

    fn identifier(&self) -> Result<Identifier> {
        Ok(Identifier::Digest {
            repository: self.reference()?.context_name(),
            digest: self.value.digest()?,
        })
    }

    fn manifest_size(&self) -> Result<i64> {
        self.value.manifest_size()
    }

    fn top_layer(&self) -> Result<String> {
        self.value
            .top_layer()
            .map(|layer| layer.diff_id.clone())
            .ok_or_else(|| ImageError::MissingRequiredField {
                image: self.repo_name.clone(),
                field: "layers",
            })
    }

    fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        self.value
            .layer_by_diff_id(diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.repo_name.clone(),
                diff_id: diff_id.to_string(),
            })?
            .uncompressed_reader()
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        let layer = Layer::from_file(path)?;
        self.append(layer)
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        let layer = Layer::from_file_with_diff_id(path, diff_id)?;
        self.append(layer)
    }

    fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let layer = layer::find(&self.previous_layers, diff_id).ok_or_else(|| {
            ImageError::LayerNotFound {
                image: self.repo_name.clone(),
                diff_id: diff_id.to_string(),
            }
        })?;
        let layer = match media::convert_layer_type(&layer.media_type, self.media_types)? {
            same if same == layer.media_type => Arc::clone(layer),
            converted => Arc::new(layer.with_media_type(converted)),
        };
        tracing::debug!(image = %self.repo_name, diff_id = %diff_id, "Reused layer");
        let next = self.value.with_layer(layer, self.created_at);
        self.install(next);
        Ok(())
    }

    fn rebase(&mut self, top_diff_id: &str, new_base: &dyn Image) -> Result<()> {
        let base = same_family::<RemoteImage>(&self.repo_name, "remote", new_base)?;
        let base_value = media::normalize(&base.value, self.media_types)?;
        let next = rebase::rebase_value(
            &self.value,
            &self.repo_name,
            top_diff_id,
            &base_value,
            self.created_at,
        )?;
        self.install(next);
        Ok(())
    }

    fn annotate_ref_name(&mut self, _ref_name: &str) -> Result<()> {
        Err(ImageError::NotImplemented {
            operation: "AnnotateRefName",
            backend: "remote",
        })
    }

    fn get_annotate_ref_name(&self) -> Result<String> {
        Err(ImageError::NotImplemented {
            operation: "GetAnnotateRefName",
            backend: "remote",
        })
    }

    fn save_as(&mut self, name: &str, additional: &[&str]) -> Result<()> {
        let config = save::prepare_config(self.value.config(), self.created_at);
        let next = self.value.with_config(config);
        self.install(next);

        let upload = self.upload()?;
        tracing::info!(image = %name, digest = %upload.digest(), "Saving image to registry");
        save::save_each(&save::destinations(name, additional), |destination| {
            let reference = ImageReference::parse(destination)?;
            let access = self.registry.access(&reference);
            self.registry
                .transport
                .push(&reference, &access, &upload)
                .map(|_| ())
        })
    }

    fn delete(&mut self) -> Result<()> {
        let reference = self.reference()?;
        let access = self.registry.access(&reference);
        self.registry.transport.delete(&reference, &access)?;
        tracing::info!(image = %self.repo_name, "Deleted image from registry");
        Ok(())
    }
}

impl RemoteImage {
    fn append(&mut self, layer: Layer) -> Result<()> {
        let media_type = media::convert_layer_type(&layer.media_type, self.media_types)?;
        let layer = Arc::new(layer.with_media_type(media_type));
        tracing::debug!(image = %self.repo_name, diff_id = %layer.diff_id, "Added layer");
        let next = self.value.with_layer(layer, self.created_at);
        self.install(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::tests::write_test_layer;
    use tempfile::TempDir;

    fn registry() -> Arc<MemoryRegistry> {
        Arc::new(MemoryRegistry::new())
    }

    fn open(registry: &Arc<MemoryRegistry>, name: &str, options: RemoteOptions) -> RemoteImage {
        RemoteImage::new(name, Arc::clone(registry) as Arc<dyn RegistryTransport>, options).unwrap()
    }

    fn layer_file(dir: &TempDir, name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        write_test_layer(&path, &[(name, content)], false);
        path
    }

    #[test]
    fn test_fresh_image_defaults() {
        let registry = registry();
        let image = open(&registry, "localhost:5000/app", RemoteOptions::new());

        assert_eq!(image.media_types(), MediaTypes::Docker);
        assert_eq!(image.os().unwrap(), "linux");
        assert_eq!(image.architecture().unwrap(), "amd64");
        assert_eq!(image.env("MISSING").unwrap(), "");
        assert!(!image.found());
        assert!(matches!(
            image.top_layer(),
            Err(ImageError::MissingRequiredField { .. })
        ));
    }

    #[test]
    fn test_save_then_open_as_base() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let mut image = open(
            &registry,
            "localhost:5000/base",
            RemoteOptions::new().with_media_types(MediaTypes::Oci),
        );
        image.add_layer(&layer_file(&tmp, "a", b"a")).unwrap();
        image.set_label("stage", "base").unwrap();
        image.save(&[]).unwrap();
        assert!(image.found());
        assert!(image.valid());

        let derived = open(
            &registry,
            "localhost:5000/app",
            RemoteOptions::new().from_base_image("localhost:5000/base"),
        );
        assert_eq!(derived.media_types(), MediaTypes::Oci);
        assert_eq!(derived.label("stage").unwrap(), "base");
        assert_eq!(derived.top_layer().unwrap(), image.top_layer().unwrap());

        let mut archive = tar::Archive::new(derived.get_layer(&image.top_layer().unwrap()).unwrap());
        assert_eq!(archive.entries().unwrap().count(), 1);
    }

    #[test]
    fn test_base_is_converted_to_requested_dialect() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let mut base = open(&registry, "localhost:5000/base", RemoteOptions::new());
        base.add_layer(&layer_file(&tmp, "a", b"a")).unwrap();
        base.save(&[]).unwrap();

        let image = open(
            &registry,
            "localhost:5000/app",
            RemoteOptions::new()
                .from_base_image("localhost:5000/base")
                .with_media_types(MediaTypes::Oci),
        );
        assert_eq!(image.value.manifest_media_type(), media::OCI_MANIFEST);
        assert_eq!(image.value.layers()[0].media_type, media::OCI_LAYER_GZIP);
    }

    #[test]
    fn test_identifier_is_stable_and_tracks_edits() {
        let registry = registry();
        let mut image = open(&registry, "localhost:5000/app:v1", RemoteOptions::new());
        let first = image.identifier().unwrap();
        assert_eq!(first, image.identifier().unwrap());
        assert!(first.to_string().starts_with("localhost:5000/app@sha256:"));

        image.set_env("A", "1").unwrap();
        assert_ne!(first, image.identifier().unwrap());
    }

    #[test]
    fn test_saved_digest_matches_identifier() {
        let registry = registry();
        let mut image = open(&registry, "localhost:5000/app", RemoteOptions::new());
        image.save(&[]).unwrap();
        let access = RegistryAccess::default();
        let stored = registry
            .head(&ImageReference::parse("localhost:5000/app").unwrap(), &access)
            .unwrap()
            .unwrap();
        assert_eq!(image.identifier().unwrap().digest(), stored);
    }

    #[test]
    fn test_reuse_layer_from_previous_image() {
        let tmp = TempDir::new().unwrap();
        let registry = registry();
        let mut previous = open(&registry, "localhost:5000/app", RemoteOptions::new());
        previous.add_layer(&layer_file(&tmp, "a", b"a")).unwrap();
        previous.save(&[]).unwrap();
        let diff_id = previous.top_layer().unwrap();

        let mut image = open(
            &registry,
            "localhost:5000/app",
            RemoteOptions::new().with_previous_image("localhost:5000/app"),
        );
        image.reuse_layer(&diff_id).unwrap();
        assert_eq!(image.top_layer().unwrap(), diff_id);

        let err = image.reuse_layer("sha256:doesnotexist").unwrap_err();
        assert!(err.to_string().contains("sha256:doesnotexist"));
        assert_eq!(image.value.layers().len(), 1);
    }

    #[test]
    fn test_annotate_ref_name_not_implemented() {
        let registry = registry();
        let mut image = open(&registry, "localhost:5000/app", RemoteOptions::new());
        assert!(matches!(
            image.annotate_ref_name("v1"),
            Err(ImageError::NotImplemented { .. })
        ));
        assert!(image.get_annotate_ref_name().is_err());
    }

    #[test]
    fn test_access_checks() {
        let registry = registry();
        registry.deny_push("localhost:5000/readonly");
        let readonly = open(&registry, "localhost:5000/readonly", RemoteOptions::new());
        assert!(readonly.check_read_access().is_ok());
        let err = readonly.check_read_write_access().unwrap_err();
        assert!(err.is_access_denied());

        let writable = open(&registry, "localhost:5000/app", RemoteOptions::new());
        assert!(writable.check_read_write_access().is_ok());
    }

    #[test]
    fn test_read_access_only_denied_on_auth_errors() {
        let registry = registry();
        let image = open(&registry, "localhost:5000/app", RemoteOptions::new());

        registry.fail_next(2);
        assert!(image.check_read_access().is_ok());

        registry.deny_read("localhost:5000/app");
        let err = image.check_read_access().unwrap_err();
        assert!(err.is_access_denied());
        assert!(image.check_read_write_access().is_err());
    }

    #[test]
    fn test_read_only_checks_retry_once() {
        let registry = registry();
        let mut image = open(&registry, "localhost:5000/app", RemoteOptions::new());
        image.save(&[]).unwrap();

        registry.fail_next(1);
        assert!(image.found());

        registry.fail_next(2);
        assert!(!image.found());
    }

    #[test]
    fn test_delete() {
        let registry = registry();
        let mut image = open(&registry, "localhost:5000/app", RemoteOptions::new());
        image.save(&[]).unwrap();
        image.delete().unwrap();
        assert!(!image.found());
    }

    #[test]
    fn test_base_from_index_selects_platform() {
        let registry = registry();
        let mut arm = open(
            &registry,
            "localhost:5000/multi:arm",
            RemoteOptions::new().with_platform(Platform::new("linux", "arm64")),
        );
        arm.save(&[]).unwrap();
        let mut amd = open(&registry, "localhost:5000/multi:amd", RemoteOptions::new());
        amd.save(&[]).unwrap();

        let descriptor = |image: &RemoteImage, platform: Platform| crate::model::Descriptor {
            media_type: media::DOCKER_MANIFEST.to_string(),
            digest: image.identifier().unwrap().digest().to_string(),
            size: image.manifest_size().unwrap(),
            platform: Some(platform),
            ..Default::default()
        };
        let index = ImageIndex {
            media_type: media::DOCKER_MANIFEST_LIST.to_string(),
            manifests: vec![
                descriptor(&amd, Platform::linux_amd64()),
                descriptor(&arm, Platform::new("linux", "arm64")),
            ],
            ..Default::default()
        };
        registry.put_manifest(
            &ImageReference::parse("localhost:5000/multi:latest").unwrap(),
            serde_json::to_vec(&index).unwrap(),
        );

        let image = open(
            &registry,
            "localhost:5000/app",
            RemoteOptions::new()
                .from_base_image("localhost:5000/multi")
                .with_platform(Platform::new("linux", "arm64")),
        );
        assert_eq!(image.architecture().unwrap(), "arm64");

        let missing = RemoteImage::new(
            "localhost:5000/app",
            Arc::clone(&registry) as Arc<dyn RegistryTransport>,
            RemoteOptions::new()
                .from_base_image("localhost:5000/multi")
                .with_platform(Platform::new("windows", "amd64")),
        );
        assert!(missing.is_err());
    }
}
