//! Immutable manifest-level image value shared by the registry and layout
//! backends.
//!
//! Every edit returns a new [`ImageValue`]; handles swap their `Arc` to the
//! new value, so a failed edit never leaves a half-applied image behind.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::error::{ImageError, Result};

use crate::layer::{self, Layer};
use crate::media::MediaTypes;
use crate::model::{ConfigFile, Descriptor, Manifest, Platform};

#[derive(Debug, Clone)]
pub struct ImageValue {
    manifest_media_type: String,
    config_media_type: String,
    config: Arc<ConfigFile>,
    layers: Vec<Arc<Layer>>,
    annotations: BTreeMap<String, String>,
}

impl ImageValue {
    /// Image with no layers for `platform`, typed in `media_types`.
    pub fn empty(platform: &Platform, media_types: MediaTypes) -> Self {
        let media_types = media_types.or(MediaTypes::Docker);
        Self {
            manifest_media_type: media_types.manifest_type().unwrap_or_default().to_string(),
            config_media_type: media_types.config_type().unwrap_or_default().to_string(),
            config: Arc::new(ConfigFile::for_platform(platform)),
            layers: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Assemble from parts; the config's diff IDs must name `layers` in order.
    pub fn from_parts(
        manifest_media_type: &str,
        config_media_type: &str,
        config: ConfigFile,
        layers: Vec<Arc<Layer>>,
    ) -> Result<Self> {
        let diff_ids = &config.rootfs.diff_ids;
        if diff_ids.len() != layers.len()
            || diff_ids.iter().zip(&layers).any(|(d, l)| *d != l.diff_id)
        {
            return Err(ImageError::ValidationFailed {
                subject: "image config".to_string(),
                message: format!(
                    "{} diff IDs do not match {} manifest layers",
                    diff_ids.len(),
                    layers.len()
                ),
            });
        }
        Ok(Self {
            manifest_media_type: manifest_media_type.to_string(),
            config_media_type: config_media_type.to_string(),
            config: Arc::new(config),
            layers,
            annotations: BTreeMap::new(),
        })
    }

    pub fn manifest_media_type(&self) -> &str {
        &self.manifest_media_type
    }

    pub fn config_media_type(&self) -> &str {
        &self.config_media_type
    }

    pub fn media_types(&self) -> MediaTypes {
        MediaTypes::of_manifest(&self.manifest_media_type)
    }

    pub fn config(&self) -> &Arc<ConfigFile> {
        &self.config
    }

    pub fn layers(&self) -> &[Arc<Layer>] {
        &self.layers
    }

    pub fn layer_by_diff_id(&self, diff_id: &str) -> Option<&Arc<Layer>> {
        layer::find(&self.layers, diff_id)
    }

    pub fn top_layer(&self) -> Option<&Arc<Layer>> {
        self.layers.last()
    }

    /// Manifest annotations.
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// New value with `config` installed. Layers are untouched, so the
    /// config's rootfs must still describe them.
    pub fn with_config(&self, config: ConfigFile) -> Self {
        Self {
            config: Arc::new(config),
            ..self.clone()
        }
    }

    /// New value with `layer` on top and a history entry stamped `created`.
    pub fn with_layer(&self, layer: Arc<Layer>, created: DateTime<Utc>) -> Self {
        let mut config = self.config.as_ref().clone();
        config.push_layer(&layer.diff_id, created);
        let mut layers = self.layers.clone();
        layers.push(layer);
        Self {
            config: Arc::new(config),
            layers,
            ..self.clone()
        }
    }

    /// New value with a replaced layer stack and a config describing it.
    pub fn with_layers(&self, config: ConfigFile, layers: Vec<Arc<Layer>>) -> Result<Self> {
        let mut value = Self::from_parts(
            &self.manifest_media_type,
            &self.config_media_type,
            config,
            layers,
        )?;
        value.annotations = self.annotations.clone();
        Ok(value)
    }

    pub fn with_media_types(
        &self,
        manifest_media_type: &str,
        config_media_type: &str,
        layers: Vec<Arc<Layer>>,
    ) -> Self {
        Self {
            manifest_media_type: manifest_media_type.to_string(),
            config_media_type: config_media_type.to_string(),
            layers,
            ..self.clone()
        }
    }

    pub fn with_annotation(&self, key: &str, value: &str) -> Self {
        let mut annotations = self.annotations.clone();
        annotations.insert(key.to_string(), value.to_string());
        Self {
            annotations,
            ..self.clone()
        }
    }

    /// Serialized config blob.
    pub fn config_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self.config.as_ref())?)
    }

    pub fn config_digest(&self) -> Result<String> {
        Ok(layer::sha256_digest(&self.config_bytes()?))
    }

    pub fn manifest(&self) -> Result<Manifest> {
        let config_bytes = self.config_bytes()?;
        Ok(Manifest {
            schema_version: 2,
            media_type: self.manifest_media_type.clone(),
            config: Descriptor {
                media_type: self.config_media_type.clone(),
                digest: layer::sha256_digest(&config_bytes),
                size: config_bytes.len() as i64,
                ..Default::default()
            },
            layers: self.layers.iter().map(|l| l.descriptor()).collect(),
            annotations: self.annotations.clone(),
        })
    }

    /// Canonical manifest bytes; the image digest is computed over these.
    pub fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.manifest()?)?)
    }

    pub fn digest(&self) -> Result<String> {
        Ok(layer::sha256_digest(&self.raw_manifest()?))
    }

    pub fn manifest_size(&self) -> Result<i64> {
        Ok(self.raw_manifest()?.len() as i64)
    }
}
