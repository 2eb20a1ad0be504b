//! Rebase: swap an image's inherited base layers for another base.
//!
//! The inherited prefix is described by a [`LayerRange`] into the receiver's
//! layer sequence rather than by a separate image type.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::error::{ImageError, Result};

use crate::model::ConfigFile;
use crate::value::ImageValue;

/// Half-open range `[start, end)` of layer indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerRange {
    pub start: usize,
    pub end: usize,
}

impl LayerRange {
    /// Range from the bottom layer up to and including `top_diff_id`.
    pub fn through_diff_id(diff_ids: &[String], top_diff_id: &str) -> Option<Self> {
        diff_ids
            .iter()
            .position(|diff_id| diff_id == top_diff_id)
            .map(|idx| Self {
                start: 0,
                end: idx + 1,
            })
    }

    /// Like [`LayerRange::through_diff_id`] but fails with `BaseLayerNotFound`.
    pub fn require(diff_ids: &[String], top_diff_id: &str, image: &str) -> Result<Self> {
        Self::through_diff_id(diff_ids, top_diff_id).ok_or_else(|| ImageError::BaseLayerNotFound {
            image: image.to_string(),
            diff_id: top_diff_id.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Replace `own[range]` with `new_base`, keeping everything above it in order.
pub fn splice<T: Clone>(own: &[T], range: LayerRange, new_base: &[T]) -> Vec<T> {
    own[..range.start]
        .iter()
        .chain(new_base)
        .chain(&own[range.end..])
        .cloned()
        .collect()
}

/// Config of the rebased image.
///
/// Rootfs and history are spliced like the layers; the runtime config stays
/// the receiver's and the platform identity comes from `new_base`.
pub fn rebase_config(
    own: &ConfigFile,
    range: LayerRange,
    new_base: &ConfigFile,
    created: DateTime<Utc>,
) -> ConfigFile {
    let mut config = own.clone();
    config.rootfs.diff_ids = splice(&own.rootfs.diff_ids, range, &new_base.rootfs.diff_ids);
    config.history = splice(
        &own.layer_history(created),
        range,
        &new_base.layer_history(created),
    );
    config.architecture = new_base.architecture.clone();
    config.os = new_base.os.clone();
    config.os_version = new_base.os_version.clone();
    config
}

/// Rebase a manifest-level image value onto `new_base`.
pub fn rebase_value(
    own: &ImageValue,
    image: &str,
    top_diff_id: &str,
    new_base: &ImageValue,
    created: DateTime<Utc>,
) -> Result<ImageValue> {
    let range = LayerRange::require(&own.config().rootfs.diff_ids, top_diff_id, image)?;
    let layers: Vec<Arc<_>> = splice(own.layers(), range, new_base.layers());
    let config = rebase_config(own.config(), range, new_base.config(), created);

    tracing::debug!(
        image = %image,
        replaced = range.len(),
        new_base_layers = new_base.layers().len(),
        kept = own.layers().len() - range.end,
        "Rebased layer stack"
    );

    own.with_layers(config, layers)
}
