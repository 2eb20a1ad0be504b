//! Registry transport: the wire-level collaborator of [`super::RemoteImage`].
//!
//! [`OciDistributionTransport`] talks to real registries through
//! `oci-distribution`; [`super::memory::MemoryRegistry`] keeps everything in
//! process.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use imgkit_core::config::RegistrySetting;
use imgkit_core::error::{ImageError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::{OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use parking_lot::Mutex;

use super::credentials::RegistryAuth;
use crate::layer::{sha256_digest, BlobSource};
use crate::media;
use crate::model::{Descriptor, Manifest};
use crate::reference::ImageReference;

/// Credentials and connection flags for one registry call.
#[derive(Debug, Clone, Default)]
pub struct RegistryAccess {
    pub auth: RegistryAuth,
    pub setting: RegistrySetting,
}

/// A manifest or index as stored by the registry.
#[derive(Debug, Clone)]
pub struct ManifestResponse {
    pub raw: Vec<u8>,
    pub digest: String,
    pub media_type: String,
}

impl ManifestResponse {
    pub fn new(raw: Vec<u8>, digest: String) -> Self {
        let media_type = serde_json::from_slice::<serde_json::Value>(&raw)
            .ok()
            .and_then(|doc| doc.get("mediaType").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_default();
        Self {
            raw,
            digest,
            media_type,
        }
    }

    /// Whether this is an index / manifest list rather than an image manifest.
    pub fn is_index(&self) -> bool {
        match self.media_type.as_str() {
            media::OCI_INDEX | media::DOCKER_MANIFEST_LIST => true,
            "" => serde_json::from_slice::<serde_json::Value>(&self.raw)
                .map(|doc| doc.get("manifests").is_some())
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// Everything needed to push one image.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub manifest: Manifest,
    pub raw_manifest: Vec<u8>,
    pub config: Vec<u8>,
    /// Compressed layer blobs, in manifest order
    pub layers: Vec<Vec<u8>>,
}

impl ImageUpload {
    pub fn digest(&self) -> String {
        sha256_digest(&self.raw_manifest)
    }
}

/// Registry operations used by the remote backend.
///
/// Errors for refused access are `Unauthorized` or `Forbidden` so callers can
/// tell them apart from other failures.
pub trait RegistryTransport: Send + Sync {
    /// Digest of the manifest `reference` points at, `None` when absent.
    fn head(&self, reference: &ImageReference, access: &RegistryAccess) -> Result<Option<String>>;

    /// Manifest or index `reference` points at, `None` when absent.
    fn get(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
    ) -> Result<Option<ManifestResponse>>;

    fn fetch_blob(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>>;

    /// Upload blobs and manifest; returns the manifest digest.
    fn push(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
        upload: &ImageUpload,
    ) -> Result<String>;

    fn delete(&self, reference: &ImageReference, access: &RegistryAccess) -> Result<()>;

    fn check_push_permission(&self, reference: &ImageReference, access: &RegistryAccess)
        -> Result<()>;
}

/// Reads layer blobs of one repository on demand.
#[derive(Clone)]
pub struct RegistryBlobSource {
    transport: Arc<dyn RegistryTransport>,
    reference: ImageReference,
    access: RegistryAccess,
}

impl RegistryBlobSource {
    pub fn new(
        transport: Arc<dyn RegistryTransport>,
        reference: ImageReference,
        access: RegistryAccess,
    ) -> Self {
        Self {
            transport,
            reference,
            access,
        }
    }
}

impl fmt::Debug for RegistryBlobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryBlobSource")
            .field("reference", &self.reference.to_string())
            .finish()
    }
}

impl BlobSource for RegistryBlobSource {
    fn fetch(&self, digest: &str) -> Result<Vec<u8>> {
        let descriptor = Descriptor {
            digest: digest.to_string(),
            ..Default::default()
        };
        self.transport
            .fetch_blob(&self.reference, &self.access, &descriptor)
    }
}

/// Transport backed by the `oci-distribution` client.
///
/// Each call blocks on a private current-thread runtime. One client is kept
/// per registry host so bearer tokens are reused between calls.
pub struct OciDistributionTransport {
    runtime: tokio::runtime::Runtime,
    clients: Mutex<HashMap<String, Client>>,
}

impl OciDistributionTransport {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            runtime,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, registry: &str, setting: RegistrySetting) -> Client {
        self.clients
            .lock()
            .entry(registry.to_string())
            .or_insert_with(|| {
                let protocol = if setting.insecure {
                    ClientProtocol::Http
                } else {
                    ClientProtocol::Https
                };
                Client::new(ClientConfig {
                    protocol,
                    accept_invalid_certificates: setting.insecure_skip_verify,
                    ..Default::default()
                })
            })
            .clone()
    }

    fn oci_reference(reference: &ImageReference) -> Result<Reference> {
        reference
            .full_reference()
            .parse::<Reference>()
            .map_err(|e| ImageError::InvalidReference {
                reference: reference.to_string(),
                message: e.to_string(),
            })
    }
}

fn oci_auth(auth: &RegistryAuth) -> OciRegistryAuth {
    match auth.credentials() {
        Some((user, pass)) => OciRegistryAuth::Basic(user.to_string(), pass.to_string()),
        None => OciRegistryAuth::Anonymous,
    }
}

fn is_not_found(err: &OciDistributionError) -> bool {
    matches!(
        err,
        OciDistributionError::ImageManifestNotFoundError(_)
            | OciDistributionError::ServerError { code: 404, .. }
    )
}

fn registry_error(registry: &str, action: &str, err: OciDistributionError) -> ImageError {
    let message = format!("{}: {}", action, err);
    match err {
        OciDistributionError::AuthenticationFailure(_)
        | OciDistributionError::UnauthorizedError { .. }
        | OciDistributionError::ServerError { code: 401, .. } => ImageError::Unauthorized {
            registry: registry.to_string(),
            message,
        },
        OciDistributionError::ServerError { code: 403, .. } => ImageError::Forbidden {
            registry: registry.to_string(),
            message,
        },
        _ => ImageError::Registry {
            registry: registry.to_string(),
            message,
        },
    }
}

const ACCEPTED_MANIFESTS: [&str; 4] = [
    media::OCI_MANIFEST,
    media::OCI_INDEX,
    media::DOCKER_MANIFEST,
    media::DOCKER_MANIFEST_LIST,
];

impl RegistryTransport for OciDistributionTransport {
    fn head(&self, reference: &ImageReference, access: &RegistryAccess) -> Result<Option<String>> {
        let oci_ref = Self::oci_reference(reference)?;
        let client = self.client(&reference.registry, access.setting);
        let auth = oci_auth(&access.auth);

        match self
            .runtime
            .block_on(client.fetch_manifest_digest(&oci_ref, &auth))
        {
            Ok(digest) => Ok(Some(digest)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(registry_error(&reference.registry, "Failed to resolve manifest", e)),
        }
    }

    fn get(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
    ) -> Result<Option<ManifestResponse>> {
        let oci_ref = Self::oci_reference(reference)?;
        let client = self.client(&reference.registry, access.setting);
        let auth = oci_auth(&access.auth);

        match self.runtime.block_on(client.pull_manifest_raw(
            &oci_ref,
            &auth,
            &ACCEPTED_MANIFESTS,
        )) {
            Ok((raw, digest)) => Ok(Some(ManifestResponse::new(raw, digest))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(registry_error(&reference.registry, "Failed to pull manifest", e)),
        }
    }

    fn fetch_blob(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
        descriptor: &Descriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = Self::oci_reference(reference)?;
        let client = self.client(&reference.registry, access.setting);
        let auth = oci_auth(&access.auth);
        let oci_descriptor = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: descriptor.size,
            ..Default::default()
        };

        tracing::debug!(reference = %reference, digest = %descriptor.digest, "Pulling blob");
        self.runtime.block_on(async {
            client
                .auth(&oci_ref, &auth, RegistryOperation::Pull)
                .await
                .map_err(|e| registry_error(&reference.registry, "Failed to authenticate", e))?;
            let mut data = Vec::new();
            client
                .pull_blob(&oci_ref, &oci_descriptor, &mut data)
                .await
                .map_err(|e| {
                    registry_error(
                        &reference.registry,
                        &format!("Failed to pull blob {}", descriptor.digest),
                        e,
                    )
                })?;
            Ok(data)
        })
    }

    fn push(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
        upload: &ImageUpload,
    ) -> Result<String> {
        let oci_ref = Self::oci_reference(reference)?;
        let client = self.client(&reference.registry, access.setting);
        let auth = oci_auth(&access.auth);

        let manifest: OciImageManifest = serde_json::from_slice(&upload.raw_manifest)?;
        let config = Config::new(
            upload.config.clone(),
            upload.manifest.config.media_type.clone(),
            None,
        );
        let layers: Vec<ImageLayer> = upload
            .manifest
            .layers
            .iter()
            .zip(&upload.layers)
            .map(|(descriptor, data)| {
                ImageLayer::new(data.clone(), descriptor.media_type.clone(), None)
            })
            .collect();

        tracing::info!(reference = %reference, layers = layers.len(), "Pushing image to registry");
        let response = self
            .runtime
            .block_on(client.push(&oci_ref, &layers, config, &auth, Some(manifest)))
            .map_err(|e| registry_error(&reference.registry, "Failed to push image", e))?;

        let digest = upload.digest();
        tracing::info!(
            reference = %reference,
            digest = %digest,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );
        Ok(digest)
    }

    fn delete(&self, _reference: &ImageReference, _access: &RegistryAccess) -> Result<()> {
        Err(ImageError::NotImplemented {
            operation: "Delete",
            backend: "oci-distribution",
        })
    }

    fn check_push_permission(
        &self,
        reference: &ImageReference,
        access: &RegistryAccess,
    ) -> Result<()> {
        let oci_ref = Self::oci_reference(reference)?;
        let client = self.client(&reference.registry, access.setting);
        let auth = oci_auth(&access.auth);

        self.runtime
            .block_on(client.auth(&oci_ref, &auth, RegistryOperation::Push))
            .map(|_| ())
            .map_err(|e| registry_error(&reference.registry, "Push access denied", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_response_media_type() {
        let raw = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media::OCI_INDEX,
            "manifests": []
        }))
        .unwrap();
        let response = ManifestResponse::new(raw, "sha256:x".to_string());
        assert_eq!(response.media_type, media::OCI_INDEX);
        assert!(response.is_index());
    }

    #[test]
    fn test_manifest_response_untyped_index() {
        let raw = br#"{"schemaVersion":2,"manifests":[]}"#.to_vec();
        assert!(ManifestResponse::new(raw, String::new()).is_index());

        let raw = br#"{"schemaVersion":2,"config":{},"layers":[]}"#.to_vec();
        assert!(!ManifestResponse::new(raw, String::new()).is_index());
    }

    #[test]
    fn test_oci_reference_conversion() {
        let reference = ImageReference::parse("localhost:5000/team/app:v1").unwrap();
        let oci_ref = OciDistributionTransport::oci_reference(&reference).unwrap();
        assert_eq!(oci_ref.registry(), "localhost:5000");
        assert_eq!(oci_ref.repository(), "team/app");
        assert_eq!(oci_ref.tag(), Some("v1"));
    }

    #[test]
    fn test_error_classification() {
        let err = registry_error(
            "ghcr.io",
            "push",
            OciDistributionError::AuthenticationFailure("bad token".to_string()),
        );
        assert!(matches!(err, ImageError::Unauthorized { .. }));
        assert!(err.is_access_denied());

        let err = registry_error(
            "ghcr.io",
            "pull",
            OciDistributionError::ImageManifestNotFoundError("gone".to_string()),
        );
        assert!(matches!(err, ImageError::Registry { .. }));
    }

    #[test]
    fn test_oci_auth() {
        assert!(matches!(
            oci_auth(&RegistryAuth::anonymous()),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            oci_auth(&RegistryAuth::basic("u", "p")),
            OciRegistryAuth::Basic(_, _)
        ));
    }
}
