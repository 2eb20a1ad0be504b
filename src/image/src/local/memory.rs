//! In-process daemon used by tests and dry runs.

use std::collections::HashMap;
use std::io::Read;

use imgkit_core::error::{ImageError, Result};
use parking_lot::Mutex;

use super::daemon::{DaemonClient, ImageArchive, ImageInspect};
use crate::identity::config_hash;
use crate::model::{ConfigFile, History};
use crate::reference::ImageReference;

#[derive(Debug)]
struct StoredImage {
    config: ConfigFile,
    layers: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct State {
    images: HashMap<String, StoredImage>,
    tags: HashMap<String, String>,
}

impl State {
    /// Image ID for a tag or an ID.
    fn resolve(&self, reference: &str) -> Option<String> {
        if self.images.contains_key(reference) {
            return Some(reference.to_string());
        }
        let tag = canonical_tag(reference).ok()?;
        self.tags.get(&tag).cloned()
    }

    fn repo_tags(&self, image_id: &str) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tags
            .iter()
            .filter(|(_, id)| id.as_str() == image_id)
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }
}

/// `registry/repository:tag` form a daemon stores tags under.
fn canonical_tag(reference: &str) -> Result<String> {
    ImageReference::parse(reference).map(|r| r.to_string())
}

/// Daemon that stores loaded images in memory.
///
/// Image IDs are the config digest, as real engines compute them.
#[derive(Debug, Default)]
pub struct MemoryDaemon {
    state: Mutex<State>,
}

impl MemoryDaemon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct images stored.
    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }
}

impl DaemonClient for MemoryDaemon {
    fn inspect(&self, reference: &str) -> Result<Option<ImageInspect>> {
        let state = self.state.lock();
        Ok(state.resolve(reference).and_then(|id| {
            state.images.get(&id).map(|image| {
                ImageInspect::from_config(&id, state.repo_tags(&id), &image.config)
            })
        }))
    }

    fn history(&self, reference: &str) -> Result<Vec<History>> {
        let state = self.state.lock();
        state
            .resolve(reference)
            .and_then(|id| state.images.get(&id))
            .map(|image| image.config.history.clone())
            .ok_or_else(|| ImageError::Daemon(format!("No such image: {}", reference)))
    }

    fn load(&self, archive: ImageArchive) -> Result<String> {
        let tag = canonical_tag(&archive.repo_tag)?;

        // Read layer content before taking the lock; sources may call back in.
        let mut layers = HashMap::new();
        for layer in &archive.layers {
            let mut data = Vec::new();
            layer.uncompressed_reader()?.read_to_end(&mut data)?;
            layers.insert(layer.diff_id.clone(), data);
        }

        let id = config_hash(&archive.config)?;
        let mut state = self.state.lock();
        state.images.insert(
            id.clone(),
            StoredImage {
                config: archive.config,
                layers,
            },
        );
        state.tags.insert(tag, id.clone());
        tracing::debug!(image_id = %id, repo_tag = %archive.repo_tag, "Loaded image into memory daemon");
        Ok(id)
    }

    fn tag(&self, image_id: &str, reference: &str) -> Result<()> {
        let tag = canonical_tag(reference)?;
        let mut state = self.state.lock();
        if !state.images.contains_key(image_id) {
            return Err(ImageError::Daemon(format!("No such image: {}", image_id)));
        }
        state.tags.insert(tag, image_id.to_string());
        Ok(())
    }

    fn remove(&self, reference: &str) -> Result<()> {
        let mut state = self.state.lock();
        let id = state
            .resolve(reference)
            .ok_or_else(|| ImageError::Daemon(format!("No such image: {}", reference)))?;
        state.tags.retain(|_, tagged| *tagged != id);
        state.images.remove(&id);
        Ok(())
    }

    fn layer_blob(&self, image_id: &str, diff_id: &str) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state
            .images
            .get(image_id)
            .and_then(|image| image.layers.get(diff_id))
            .cloned()
            .ok_or_else(|| {
                ImageError::Daemon(format!("Image {} has no layer {}", image_id, diff_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;

    fn archive(tag: &str) -> ImageArchive {
        ImageArchive {
            repo_tag: tag.to_string(),
            config: ConfigFile::for_platform(&Platform::linux_amd64()),
            layers: Vec::new(),
        }
    }

    #[test]
    fn test_load_and_inspect() {
        let daemon = MemoryDaemon::new();
        let id = daemon.load(archive("app")).unwrap();

        let inspect = daemon.inspect("app:latest").unwrap().unwrap();
        assert_eq!(inspect.id, id);
        assert_eq!(inspect.repo_tags, vec!["docker.io/library/app:latest"]);
        assert_eq!(daemon.inspect(&id).unwrap().unwrap().id, id);
        assert!(daemon.inspect("other").unwrap().is_none());
    }

    #[test]
    fn test_tag_rejects_bad_reference() {
        let daemon = MemoryDaemon::new();
        let id = daemon.load(archive("app")).unwrap();
        assert!(matches!(
            daemon.tag(&id, "bad::name"),
            Err(ImageError::InvalidReference { .. })
        ));
        daemon.tag(&id, "app:v2").unwrap();
        assert_eq!(daemon.inspect("app:latest").unwrap().unwrap().repo_tags.len(), 2);
    }

    #[test]
    fn test_remove() {
        let daemon = MemoryDaemon::new();
        daemon.load(archive("app")).unwrap();
        daemon.remove("app").unwrap();
        assert!(daemon.inspect("app").unwrap().is_none());
        assert_eq!(daemon.image_count(), 0);
        assert!(daemon.remove("app").is_err());
    }
}
