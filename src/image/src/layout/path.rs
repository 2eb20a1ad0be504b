//! Reader and writer for OCI image layout directories.
//!
//! A layout is an `oci-layout` marker, an `index.json` and a content-addressed
//! `blobs/<algorithm>/<hex>` store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use imgkit_core::error::{ImageError, Result};

use crate::layer::{self, BlobSource, Layer};
use crate::media;
use crate::model::{ConfigFile, Descriptor, ImageIndex, Manifest, Platform};
use crate::value::ImageValue;

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// Index annotation naming the reference an entry was saved under.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// A validated layout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayoutPath {
    root: PathBuf,
}

fn layout_error(path: &Path, message: impl Into<String>) -> ImageError {
    ImageError::Layout {
        path: path.display().to_string(),
        message: message.into(),
    }
}

/// Whether `root` holds a layout with an index.
pub fn image_exists(root: &Path) -> bool {
    root.join(OCI_LAYOUT_FILE).is_file() && root.join(INDEX_FILE).is_file()
}

impl LayoutPath {
    /// Open an existing layout.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        for (entry, is_dir) in [(OCI_LAYOUT_FILE, false), (INDEX_FILE, false), (BLOBS_DIR, true)] {
            let path = root.join(entry);
            let present = if is_dir { path.is_dir() } else { path.is_file() };
            if !present {
                return Err(layout_error(
                    root,
                    format!("Not a valid OCI layout: missing {}", entry),
                ));
            }
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Initialize a layout at `root` holding `index`, creating directories as
    /// needed. Existing blobs are kept; the index is replaced.
    pub fn write(root: impl AsRef<Path>, index: &ImageIndex) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root.join(BLOBS_DIR).join("sha256"))
            .map_err(|e| layout_error(root, format!("Failed to create layout: {}", e)))?;
        fs::write(root.join(OCI_LAYOUT_FILE), LAYOUT_VERSION)
            .map_err(|e| layout_error(root, format!("Failed to write oci-layout: {}", e)))?;
        let path = Self {
            root: root.to_path_buf(),
        };
        path.write_index(index)?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn read_index(&self) -> Result<ImageIndex> {
        let index_path = self.root.join(INDEX_FILE);
        let content = fs::read(&index_path)
            .map_err(|e| layout_error(&index_path, format!("Failed to read index.json: {}", e)))?;
        serde_json::from_slice(&content)
            .map_err(|e| layout_error(&index_path, format!("Failed to parse index.json: {}", e)))
    }

    fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let index_path = self.root.join(INDEX_FILE);
        fs::write(&index_path, serde_json::to_vec_pretty(index)?)
            .map_err(|e| layout_error(&index_path, format!("Failed to write index.json: {}", e)))
    }

    /// Path of a blob by digest (`sha256:abc` -> `blobs/sha256/abc`).
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
        self.root.join(BLOBS_DIR).join(algorithm).join(hash)
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|e| layout_error(&path, format!("Failed to read blob: {}", e)))
    }

    /// Store a blob unless one with the same digest is already present.
    pub fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let path = self.blob_path(digest);
        if path.is_file() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| layout_error(parent, format!("Failed to create blob dir: {}", e)))?;
        }
        fs::write(&path, data).map_err(|e| layout_error(&path, format!("Failed to write blob: {}", e)))
    }

    /// Write every blob of `image` and add its manifest to the index, with
    /// `annotations` on the index entry.
    pub fn append_image(
        &self,
        image: &ImageValue,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Descriptor> {
        let config = image.config_bytes()?;
        self.write_blob(&layer::sha256_digest(&config), &config)?;
        for layer in image.layers() {
            self.write_blob(&layer.digest, &layer.compressed()?)?;
        }

        let raw_manifest = image.raw_manifest()?;
        let digest = layer::sha256_digest(&raw_manifest);
        self.write_blob(&digest, &raw_manifest)?;

        let platform = image.config().platform();
        let descriptor = Descriptor {
            media_type: image.manifest_media_type().to_string(),
            digest,
            size: raw_manifest.len() as i64,
            annotations: annotations.clone(),
            platform: (!platform.is_empty()).then_some(platform),
            ..Default::default()
        };

        let mut index = self.read_index()?;
        index.manifests.push(descriptor.clone());
        self.write_index(&index)?;
        tracing::debug!(
            path = %self.root.display(),
            digest = %descriptor.digest,
            "Appended image to layout"
        );
        Ok(descriptor)
    }

    /// Image whose manifest `descriptor` points at.
    pub fn image(&self, descriptor: &Descriptor) -> Result<ImageValue> {
        let raw_manifest = self.read_blob(&descriptor.digest)?;
        let manifest: Manifest = serde_json::from_slice(&raw_manifest)?;
        let raw_config = self.read_blob(&manifest.config.digest)?;
        let config: ConfigFile = serde_json::from_slice(&raw_config)?;

        let source: Arc<dyn BlobSource> = Arc::new(LayoutBlobSource {
            layout: self.clone(),
        });
        let layers = manifest
            .layers
            .iter()
            .zip(&config.rootfs.diff_ids)
            .map(|(layer, diff_id)| Arc::new(Layer::from_source(layer, diff_id, Arc::clone(&source))))
            .collect();

        let manifest_type = if manifest.media_type.is_empty() {
            media::OCI_MANIFEST
        } else {
            manifest.media_type.as_str()
        };
        let value =
            ImageValue::from_parts(manifest_type, &manifest.config.media_type, config, layers)?;
        Ok(manifest
            .annotations
            .iter()
            .fold(value, |value, (key, val)| value.with_annotation(key, val)))
    }

    /// Image for `platform`, descending through nested indexes.
    ///
    /// `None` when the index is empty.
    pub fn image_for_platform(&self, platform: &Platform) -> Result<Option<(Descriptor, ImageValue)>> {
        let mut index = self.read_index()?;
        if index.manifests.is_empty() {
            return Ok(None);
        }
        loop {
            let entry = index.select(platform).cloned().ok_or_else(|| {
                layout_error(
                    &self.root,
                    format!(
                        "no manifest for platform {}/{}",
                        platform.os, platform.architecture
                    ),
                )
            })?;
            if entry.media_type == media::OCI_INDEX || entry.media_type == media::DOCKER_MANIFEST_LIST {
                index = serde_json::from_slice(&self.read_blob(&entry.digest)?)?;
                continue;
            }
            let image = self.image(&entry)?;
            return Ok(Some((entry, image)));
        }
    }
}

/// Reads layer blobs from a layout on demand.
#[derive(Debug)]
struct LayoutBlobSource {
    layout: LayoutPath,
}

impl BlobSource for LayoutBlobSource {
    fn fetch(&self, digest: &str) -> Result<Vec<u8>> {
        self.layout.read_blob(digest)
    }
}
