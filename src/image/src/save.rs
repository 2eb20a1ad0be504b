//! Save preparation and multi-destination error collection.

use chrono::{DateTime, Utc};
use imgkit_core::error::{ImageError, Result, SaveDiagnostic, SaveError};

use crate::model::{ConfigFile, History};

/// Config as it is persisted: `created` stamped, build provenance cleared and
/// history rebuilt as one bare entry per layer carrying only `created`.
pub fn prepare_config(config: &ConfigFile, created: DateTime<Utc>) -> ConfigFile {
    let mut prepared = config.clone();
    prepared.created = Some(created);
    prepared.docker_version.clear();
    prepared.container.clear();
    prepared.history = vec![History::created_at(created); config.rootfs.diff_ids.len()];
    prepared
}

/// Run `write` for every destination in order, collecting failures.
///
/// Destinations that succeed stay written even when others fail.
pub fn save_each<F>(destinations: &[&str], mut write: F) -> Result<()>
where
    F: FnMut(&str) -> Result<()>,
{
    let mut errors = Vec::new();
    for destination in destinations {
        match write(destination) {
            Ok(()) => tracing::info!(destination = %destination, "Image saved"),
            Err(e) => {
                tracing::warn!(destination = %destination, error = %e, "Failed to save image");
                errors.push(SaveDiagnostic {
                    image_name: destination.to_string(),
                    cause: Box::new(e),
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ImageError::Save(SaveError { errors }))
    }
}

/// `primary` followed by `additional`.
pub fn destinations<'a>(primary: &'a str, additional: &[&'a str]) -> Vec<&'a str> {
    std::iter::once(primary).chain(additional.iter().copied()).collect()
}
