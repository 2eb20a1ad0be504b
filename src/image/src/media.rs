//! Media-type dialects (OCI vs Docker) and conversion between them.

use std::sync::Arc;

use imgkit_core::error::{ImageError, Result};

use crate::value::ImageValue;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const OCI_NONDISTRIBUTABLE_LAYER: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
pub const OCI_NONDISTRIBUTABLE_LAYER_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_FOREIGN_LAYER: &str = "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// Requested manifest/config dialect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaTypes {
    /// Let the backend decide.
    #[default]
    Default,
    Oci,
    Docker,
}

impl MediaTypes {
    /// Dialect a manifest media type belongs to; `Default` when unrecognized.
    pub fn of_manifest(media_type: &str) -> Self {
        match media_type {
            OCI_MANIFEST | OCI_INDEX => Self::Oci,
            DOCKER_MANIFEST | DOCKER_MANIFEST_LIST => Self::Docker,
            _ => Self::Default,
        }
    }

    /// `self`, or `fallback` when no dialect was requested.
    pub fn or(self, fallback: MediaTypes) -> Self {
        match self {
            Self::Default => fallback,
            other => other,
        }
    }

    pub fn manifest_type(self) -> Option<&'static str> {
        match self {
            Self::Oci => Some(OCI_MANIFEST),
            Self::Docker => Some(DOCKER_MANIFEST),
            Self::Default => None,
        }
    }

    pub fn config_type(self) -> Option<&'static str> {
        match self {
            Self::Oci => Some(OCI_CONFIG),
            Self::Docker => Some(DOCKER_CONFIG),
            Self::Default => None,
        }
    }

    /// Media type for a gzip-compressed layer in this dialect.
    pub fn layer_type(self) -> Option<&'static str> {
        match self {
            Self::Oci => Some(OCI_LAYER_GZIP),
            Self::Docker => Some(DOCKER_LAYER_GZIP),
            Self::Default => None,
        }
    }
}

impl std::fmt::Display for MediaTypes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Oci => write!(f, "oci"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Whether a layer media type denotes an uncompressed tar stream.
pub fn is_uncompressed_layer(media_type: &str) -> bool {
    matches!(
        media_type,
        OCI_LAYER | OCI_NONDISTRIBUTABLE_LAYER | DOCKER_LAYER
    )
}

/// Map a layer media type into `target`'s dialect.
///
/// Fails when the dialect has no equivalent, e.g. zstd layers in Docker.
pub fn convert_layer_type(media_type: &str, target: MediaTypes) -> Result<&'static str> {
    let converted = match (target, media_type) {
        (MediaTypes::Oci, OCI_LAYER | DOCKER_LAYER) => Some(OCI_LAYER),
        (MediaTypes::Oci, OCI_LAYER_GZIP | DOCKER_LAYER_GZIP) => Some(OCI_LAYER_GZIP),
        (MediaTypes::Oci, OCI_LAYER_ZSTD) => Some(OCI_LAYER_ZSTD),
        (MediaTypes::Oci, OCI_NONDISTRIBUTABLE_LAYER) => Some(OCI_NONDISTRIBUTABLE_LAYER),
        (MediaTypes::Oci, OCI_NONDISTRIBUTABLE_LAYER_GZIP | DOCKER_FOREIGN_LAYER) => {
            Some(OCI_NONDISTRIBUTABLE_LAYER_GZIP)
        }
        (MediaTypes::Docker, OCI_LAYER | DOCKER_LAYER) => Some(DOCKER_LAYER),
        (MediaTypes::Docker, OCI_LAYER_GZIP | DOCKER_LAYER_GZIP) => Some(DOCKER_LAYER_GZIP),
        (MediaTypes::Docker, OCI_NONDISTRIBUTABLE_LAYER_GZIP | DOCKER_FOREIGN_LAYER) => {
            Some(DOCKER_FOREIGN_LAYER)
        }
        _ => None,
    };
    converted.ok_or_else(|| {
        ImageError::MediaType(format!(
            "layer media type {} has no {} equivalent",
            media_type, target
        ))
    })
}

/// Rewrite `image` so its manifest, config and layer media types all belong
/// to `requested`.
///
/// Returns an unchanged copy when the manifest and config already match or
/// no dialect was requested. Any layer without an equivalent fails the whole
/// conversion and nothing is returned.
pub fn normalize(image: &ImageValue, requested: MediaTypes) -> Result<ImageValue> {
    let (Some(manifest_type), Some(config_type)) =
        (requested.manifest_type(), requested.config_type())
    else {
        return Ok(image.clone());
    };

    if image.manifest_media_type() == manifest_type && image.config_media_type() == config_type {
        return Ok(image.clone());
    }

    let layers = image
        .layers()
        .iter()
        .map(|layer| {
            let media_type = convert_layer_type(&layer.media_type, requested)?;
            if layer.media_type == media_type {
                Ok(Arc::clone(layer))
            } else {
                Ok(Arc::new(layer.with_media_type(media_type)))
            }
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        from = %image.manifest_media_type(),
        to = %manifest_type,
        layers = layers.len(),
        "Converted image media types"
    );

    Ok(image.with_media_types(manifest_type, config_type, layers))
}
