//! Structural checks of manifest, index and config documents.
//!
//! Parsing goes through `oci-spec` so documents are checked against the
//! upstream OCI types rather than this crate's lenient models.

use imgkit_core::error::{ImageError, Result};
use oci_spec::image::{ImageConfiguration, ImageIndex, ImageManifest};

fn failed(subject: &str, message: impl Into<String>) -> ImageError {
    ImageError::ValidationFailed {
        subject: subject.to_string(),
        message: message.into(),
    }
}

/// `sha256:` followed by 64 lowercase hex characters.
pub fn validate_digest(digest: &str) -> Result<()> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| failed(digest, "unsupported digest algorithm"))?;
    if hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(failed(digest, "malformed sha256 digest"));
    }
    Ok(())
}

/// Parse an image manifest and check its schema version and digests.
pub fn validate_manifest(raw: &[u8]) -> Result<()> {
    let manifest: ImageManifest =
        serde_json::from_slice(raw).map_err(|e| failed("manifest", e.to_string()))?;
    if manifest.schema_version() != 2 {
        return Err(failed(
            "manifest",
            format!("unsupported schema version {}", manifest.schema_version()),
        ));
    }
    validate_digest(manifest.config().digest())?;
    for layer in manifest.layers() {
        validate_digest(layer.digest())?;
        if layer.size() < 0 {
            return Err(failed(layer.digest(), "negative layer size"));
        }
    }
    Ok(())
}

/// Parse an image index and check its schema version and entry digests.
pub fn validate_index(raw: &[u8]) -> Result<()> {
    let index: ImageIndex =
        serde_json::from_slice(raw).map_err(|e| failed("index", e.to_string()))?;
    if index.schema_version() != 2 {
        return Err(failed(
            "index",
            format!("unsupported schema version {}", index.schema_version()),
        ));
    }
    for entry in index.manifests() {
        validate_digest(entry.digest())?;
    }
    Ok(())
}

/// Parse an image config; architecture and OS must be present.
pub fn validate_config(raw: &[u8]) -> Result<()> {
    let config: ImageConfiguration =
        serde_json::from_slice(raw).map_err(|e| failed("config", e.to_string()))?;
    if config.architecture().to_string().is_empty() {
        return Err(failed("config", "missing architecture"));
    }
    if config.os().to_string().is_empty() {
        return Err(failed("config", "missing OS"));
    }
    if config.rootfs().diff_ids().iter().any(|d| validate_digest(d).is_err()) {
        return Err(failed("config", "malformed diff ID in rootfs"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(c: char) -> String {
        format!("sha256:{}", c.to_string().repeat(64))
    }

    #[test]
    fn test_validate_digest() {
        assert!(validate_digest(&digest('a')).is_ok());
        assert!(validate_digest("sha256:abc").is_err());
        assert!(validate_digest(&format!("md5:{}", "a".repeat(64))).is_err());
        assert!(validate_digest(&format!("sha256:{}", "A".repeat(64))).is_err());
    }

    #[test]
    fn test_validate_manifest() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": digest('c'),
                "size": 10
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest('d'),
                "size": 20
            }]
        });
        assert!(validate_manifest(&serde_json::to_vec(&manifest).unwrap()).is_ok());
    }

    #[test]
    fn test_validate_manifest_rejects_bad_layer_digest() {
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": digest('c'),
                "size": 10
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": "sha256:short",
                "size": 20
            }]
        });
        let err = validate_manifest(&serde_json::to_vec(&manifest).unwrap()).unwrap_err();
        assert!(matches!(err, ImageError::ValidationFailed { .. }));
    }

    #[test]
    fn test_validate_manifest_rejects_garbage() {
        let err = validate_manifest(b"not json").unwrap_err();
        assert!(err.to_string().contains("manifest"));
    }

    #[test]
    fn test_validate_index() {
        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": digest('e'),
                "size": 100
            }]
        });
        assert!(validate_index(&serde_json::to_vec(&index).unwrap()).is_ok());

        let wrong_version = serde_json::json!({"schemaVersion": 1, "manifests": []});
        assert!(validate_index(&serde_json::to_vec(&wrong_version).unwrap()).is_err());
    }

    #[test]
    fn test_validate_config() {
        let config = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": [digest('f')]}
        });
        assert!(validate_config(&serde_json::to_vec(&config).unwrap()).is_ok());

        let bad = serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": ["sha256:nope"]}
        });
        assert!(validate_config(&serde_json::to_vec(&bad).unwrap()).is_err());
    }

    #[test]
    fn test_validate_config_requires_platform() {
        let no_arch = serde_json::json!({
            "architecture": "",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        let err = validate_config(&serde_json::to_vec(&no_arch).unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing architecture"));

        let no_os = serde_json::json!({
            "architecture": "arm64",
            "os": "",
            "rootfs": {"type": "layers", "diff_ids": []}
        });
        let err = validate_config(&serde_json::to_vec(&no_os).unwrap()).unwrap_err();
        assert!(err.to_string().contains("missing OS"));
    }
}
