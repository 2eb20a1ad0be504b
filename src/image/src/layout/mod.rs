//! Images stored as OCI layout directories.
//!
//! The image name is the layout directory path. Saving rewrites the
//! destination's index to hold exactly this image; blobs already present are
//! kept.

pub mod path;

use std::any::Any;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::error::{ImageError, Result};

pub use path::{image_exists, LayoutPath, REF_NAME_ANNOTATION};

use crate::identity::{config_hash, Identifier};
use crate::image::{same_family, Image};
use crate::layer::{self, Layer};
use crate::media::{self, MediaTypes};
use crate::model::{normalized_date_time, ConfigFile, ImageIndex, Manifest, Platform};
use crate::mutate::ConfigEdit;
use crate::rebase;
use crate::save;
use crate::validate;
use crate::value::ImageValue;

/// Construction options for [`LayoutImage`].
#[derive(Debug, Clone, Default)]
pub struct LayoutOptions {
    base_image_path: Option<String>,
    previous_image_path: Option<String>,
    platform: Option<Platform>,
    created_at: Option<DateTime<Utc>>,
    media_types: MediaTypes,
}

impl LayoutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the layout at `path`; a missing layout means an empty base.
    pub fn from_base_image(mut self, path: impl Into<String>) -> Self {
        self.base_image_path = Some(path.into());
        self
    }

    pub fn with_previous_image(mut self, path: impl Into<String>) -> Self {
        self.previous_image_path = Some(path.into());
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
}

/// Image for `platform` in the layout at `path`, if there is one.
fn read_layout(path: &str, platform: &Platform) -> Result<Option<ImageValue>> {
    if !image_exists(Path::new(path)) {
        return Ok(None);
    }
    let layout = LayoutPath::open(path)?;
    Ok(layout.image_for_platform(platform)?.map(|(_, image)| image))
}

/// An image in an OCI layout directory.
pub struct LayoutImage {
    path: String,
    value: Arc<ImageValue>,
    previous_layers: Arc<Vec<Arc<Layer>>>,
    created_at: DateTime<Utc>,
    media_types: MediaTypes,
    ref_name: Option<String>,
}

impl LayoutImage {
    pub fn new(path: &str, options: LayoutOptions) -> Result<Self> {
        let platform = options.platform.unwrap_or_else(Platform::linux_amd64);
        let media_types = options.media_types.or(MediaTypes::Oci);

        let base = match &options.base_image_path {
            Some(base_path) => read_layout(base_path, &platform)?,
            None => None,
        };
        let value = match base {
            Some(base) => media::normalize(&base, media_types)?,
            None => ImageValue::empty(&platform, media_types),
        };

        let previous_layers = match &options.previous_image_path {
            Some(previous_path) => read_layout(previous_path, &platform)?
                .map(|previous| previous.layers().to_vec())
                .unwrap_or_default(),
            None => Vec::new(),
        };

        Ok(Self {
            path: path.to_string(),
            value: Arc::new(value),
            previous_layers: Arc::new(previous_layers),
            created_at: options.created_at.unwrap_or_else(normalized_date_time),
            media_types,
            ref_name: None,
        })
    }

    pub fn media_types(&self) -> MediaTypes {
        self.media_types
    }

    fn install(&mut self, value: ImageValue) {
        self.value = Arc::new(value);
    }

    fn append(&mut self, layer: Layer) -> Result<()> {
        let media_type = media::convert_layer_type(&layer.media_type, self.media_types)?;
        let layer = Arc::new(layer.with_media_type(media_type));
        tracing::debug!(image = %self.path, diff_id = %layer.diff_id, "Added layer");
        let next = self.value.with_layer(layer, self.created_at);
        self.install(next);
        Ok(())
    }

    fn check_valid(&self) -> Result<()> {
        let layout = LayoutPath::open(&self.path)?;
        let raw_index = std::fs::read(layout.root().join(path::INDEX_FILE))?;
        validate::validate_index(&raw_index)?;
        let index: ImageIndex = serde_json::from_slice(&raw_index)?;
        for entry in &index.manifests {
            if entry.media_type == media::OCI_INDEX {
                continue;
            }
            let raw_manifest = layout.read_blob(&entry.digest)?;
            validate::validate_manifest(&raw_manifest)?;
            let manifest: Manifest = serde_json::from_slice(&raw_manifest)?;
            validate::validate_config(&layout.read_blob(&manifest.config.digest)?)?;
        }
        Ok(())
    }
}

impl Image for LayoutImage {
    fn name(&self) -> &str {
        &self.path
    }

    fn rename(&mut self, name: &str) {
        self.path = name.to_string();
    }

    fn kind(&self) -> &'static str {
        "layout"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn config_file(&self) -> Result<Arc<ConfigFile>> {
        Ok(Arc::clone(self.value.config()))
    }

    fn apply_edit(&mut self, edit: ConfigEdit) -> Result<()> {
        let config = edit.apply(self.value.config());
        tracing::debug!(image = %self.path, field = edit.field(), "Updated config");
        let next = self.value.with_config(config);
        self.install(next);
        Ok(())
    }

    fn found(&self) -> bool {
        image_exists(Path::new(&self.path))
    }

    fn valid(&self) -> bool {
        match self.check_valid() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(image = %self.path, error = %e, "Layout is not valid");
                false
            }
        }
    }

    fn identifier(&self) -> Result<Identifier> {
        Ok(Identifier::ConfigHash(config_hash(self.value.config())?))
    }

    fn manifest_size(&self) -> Result<i64> {
        self.value.manifest_size()
    }

    fn top_layer(&self) -> Result<String> {
        self.value
            .top_layer()
            .map(|layer| layer.diff_id.clone())
            .ok_or_else(|| ImageError::MissingRequiredField {
                image: self.path.clone(),
                field: "layers",
            })
    }

    fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>> {
        self.value
            .layer_by_diff_id(diff_id)
            .ok_or_else(|| ImageError::LayerNotFound {
                image: self.path.clone(),
                diff_id: diff_id.to_string(),
            })?
            .uncompressed_reader()
    }

    fn add_layer(&mut self, path: &Path) -> Result<()> {
        self.append(Layer::from_file(path)?)
    }

    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        self.append(Layer::from_file_with_diff_id(path, diff_id)?)
    }

    fn reuse_layer(&mut self, diff_id: &str) -> Result<()> {
        let layer = layer::find(&self.previous_layers, diff_id).ok_or_else(|| {
            ImageError::LayerNotFound {
                image: self.path.clone(),
                diff_id: diff_id.to_string(),
            }
        })?;
        let layer = match media::convert_layer_type(&layer.media_type, self.media_types)? {
            same if same == layer.media_type => Arc::clone(layer),
            converted => Arc::new(layer.with_media_type(converted)),
        };
        tracing::debug!(image = %self.path, diff_id = %diff_id, "Reused layer");
        let next = self.value.with_layer(layer, self.created_at);
        self.install(next);
        Ok(())
    }

    fn rebase(&mut self, top_diff_id: &str, new_base: &dyn Image) -> Result<()> {
        let base = same_family::<LayoutImage>(&self.path, "layout", new_base)?;
        let base_value = media::normalize(&base.value, self.media_types)?;
        let next = rebase::rebase_value(
            &self.value,
            &self.path,
            top_diff_id,
            &base_value,
            self.created_at,
        )?;
        self.install(next);
        Ok(())
    }

    fn annotate_ref_name(&mut self, ref_name: &str) -> Result<()> {
        self.ref_name = Some(ref_name.to_string());
        Ok(())
    }

    /// Empty when no ref name was set.
    fn get_annotate_ref_name(&self) -> Result<String> {
        Ok(self.ref_name.clone().unwrap_or_default())
    }

    fn save_as(&mut self, name: &str, additional: &[&str]) -> Result<()> {
        let config = save::prepare_config(self.value.config(), self.created_at);
        let next = self.value.with_config(config);
        self.install(next);

        let mut annotations = BTreeMap::new();
        if let Some(ref_name) = self.ref_name.as_deref().filter(|r| !r.is_empty()) {
            annotations.insert(REF_NAME_ANNOTATION.to_string(), ref_name.to_string());
        }

        save::save_each(&save::destinations(name, additional), |destination| {
            let layout = LayoutPath::write(destination, &ImageIndex::default())?;
            let descriptor = layout.append_image(&self.value, &annotations)?;
            tracing::debug!(path = %destination, digest = %descriptor.digest, "Wrote layout");
            Ok(())
        })
    }

    fn delete(&mut self) -> Result<()> {
        std::fs::remove_dir_all(&self.path).map_err(|e| ImageError::Layout {
            path: self.path.clone(),
            message: format!("Failed to delete layout: {}", e),
        })?;
        tracing::info!(image = %self.path, "Deleted layout");
        Ok(())
    }
}
