//! In-process registry used by tests and dry runs.

use std::collections::{HashMap, HashSet};

use imgkit_core::error::{ImageError, Result};
use parking_lot::Mutex;

use super::transport::{ImageUpload, ManifestResponse, RegistryAccess, RegistryTransport};
use crate::layer::sha256_digest;
use crate::model::Descriptor;
use crate::reference::ImageReference;

#[derive(Debug, Default)]
struct Repository {
    manifests: HashMap<String, Vec<u8>>,
    tags: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    repositories: HashMap<String, Repository>,
    blobs: HashMap<String, Vec<u8>>,
    read_denied: HashSet<String>,
    push_denied: HashSet<String>,
    transient_failures: usize,
}

impl State {
    fn take_transient_failure(&mut self, registry: &str) -> Result<()> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(ImageError::Registry {
                registry: registry.to_string(),
                message: "service temporarily unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn check_read(&self, reference: &ImageReference) -> Result<()> {
        if self.read_denied.contains(&reference.context_name()) {
            return Err(ImageError::Forbidden {
                registry: reference.registry.clone(),
                message: format!("read access to {} denied", reference.context_name()),
            });
        }
        Ok(())
    }

    fn check_push(&self, reference: &ImageReference) -> Result<()> {
        if self.push_denied.contains(&reference.context_name()) {
            return Err(ImageError::Forbidden {
                registry: reference.registry.clone(),
                message: format!("push access to {} denied", reference.context_name()),
            });
        }
        Ok(())
    }

    fn resolve(&self, reference: &ImageReference) -> Option<String> {
        let repository = self.repositories.get(&reference.context_name())?;
        let digest = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => digest.clone(),
            (None, Some(tag)) => repository.tags.get(tag)?.clone(),
            (None, None) => return None,
        };
        repository.manifests.contains_key(&digest).then_some(digest)
    }
}

/// Registry that keeps repositories, tags and blobs in memory.
///
/// Access can be denied per repository, and reads can be made to fail a
/// set number of times to exercise retries.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    state: Mutex<State>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse reads of `repository` (`registry/path`) with `Forbidden`.
    pub fn deny_read(&self, repository: &str) {
        self.state.lock().read_denied.insert(repository.to_string());
    }

    /// Refuse pushes to `repository` (`registry/path`) with `Forbidden`.
    pub fn deny_push(&self, repository: &str) {
        self.state.lock().push_denied.insert(repository.to_string());
    }

    /// Fail the next `count` existence or access checks with a retryable error.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().transient_failures = count;
    }

    /// Store a blob and return its digest.
    pub fn put_blob(&self, data: Vec<u8>) -> String {
        let digest = sha256_digest(&data);
        self.state.lock().blobs.insert(digest.clone(), data);
        digest
    }

    /// Store a raw manifest or index under `reference` and return its digest.
    pub fn put_manifest(&self, reference: &ImageReference, raw: Vec<u8>) -> String {
        let digest = sha256_digest(&raw);
        let mut state = self.state.lock();
        let repository = state
            .repositories
            .entry(reference.context_name())
            .or_default();
        repository.manifests.insert(digest.clone(), raw);
        if let Some(tag) = &reference.tag {
            repository.tags.insert(tag.clone(), digest.clone());
        }
        digest
    }

    /// Tags present in `repository`, sorted.
    pub fn tags(&self, repository: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut tags: Vec<String> = state
            .repositories
            .get(repository)
            .map(|repo| repo.tags.keys().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }
}

impl RegistryTransport for MemoryRegistry {
    fn head(&self, reference: &ImageReference, _access: &RegistryAccess) -> Result<Option<String>> {
        let mut state = self.state.lock();
        state.take_transient_failure(&reference.registry)?;
        state.check_read(reference)?;
        Ok(state.resolve(reference))
    }

    fn get(
        &self,
        reference: &ImageReference,
        _access: &RegistryAccess,
    ) -> Result<Option<ManifestResponse>> {
        let mut state = self.state.lock();
        state.take_transient_failure(&reference.registry)?;
        state.check_read(reference)?;
        Ok(state.resolve(reference).and_then(|digest| {
            state
                .repositories
                .get(&reference.context_name())
                .and_then(|repo| repo.manifests.get(&digest))
                .map(|raw| ManifestResponse::new(raw.clone(), digest.clone()))
        }))
    }

    fn fetch_blob(
        &self,
        reference: &ImageReference,
        _access: &RegistryAccess,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state.check_read(reference)?;
        state
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| ImageError::Registry {
                registry: reference.registry.clone(),
                message: format!("blob {} not found", descriptor.digest),
            })
    }

    fn push(
        &self,
        reference: &ImageReference,
        _access: &RegistryAccess,
        upload: &ImageUpload,
    ) -> Result<String> {
        self.state.lock().check_push(reference)?;
        self.put_blob(upload.config.clone());
        for layer in &upload.layers {
            self.put_blob(layer.clone());
        }
        let digest = self.put_manifest(reference, upload.raw_manifest.clone());
        tracing::debug!(reference = %reference, digest = %digest, "Stored image in memory registry");
        Ok(digest)
    }

    fn delete(&self, reference: &ImageReference, _access: &RegistryAccess) -> Result<()> {
        let mut state = self.state.lock();
        state.check_push(reference)?;
        let digest = state.resolve(reference).ok_or_else(|| ImageError::Registry {
            registry: reference.registry.clone(),
            message: format!("{} not found", reference),
        })?;
        if let Some(repository) = state.repositories.get_mut(&reference.context_name()) {
            repository.manifests.remove(&digest);
            repository.tags.retain(|_, tagged| *tagged != digest);
        }
        Ok(())
    }

    fn check_push_permission(
        &self,
        reference: &ImageReference,
        _access: &RegistryAccess,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.take_transient_failure(&reference.registry)?;
        state.check_push(reference)
    }
}
