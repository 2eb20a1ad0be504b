//! Content-addressed image identity.

use std::fmt;

use imgkit_core::error::Result;

use crate::layer::sha256_digest;
use crate::model::ConfigFile;

/// Stable identifier of an image's current content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    /// Registry image: repository plus manifest digest
    Digest { repository: String, digest: String },
    /// Daemon image ID
    ImageId(String),
    /// Hash of the canonical config JSON
    ConfigHash(String),
}

impl Identifier {
    /// The bare `sha256:...` part.
    pub fn digest(&self) -> &str {
        match self {
            Identifier::Digest { digest, .. } => digest,
            Identifier::ImageId(id) | Identifier::ConfigHash(id) => id,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Digest { repository, digest } => write!(f, "{}@{}", repository, digest),
            Identifier::ImageId(id) | Identifier::ConfigHash(id) => write!(f, "{}", id),
        }
    }
}

/// `sha256:` + hex SHA256 of the config's canonical JSON.
///
/// Field order is fixed by the struct and maps serialize sorted, so equal
/// configs always hash equal.
pub fn config_hash(config: &ConfigFile) -> Result<String> {
    Ok(sha256_digest(&serde_json::to_vec(config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Platform;

    #[test]
    fn test_digest_display() {
        let id = Identifier::Digest {
            repository: "localhost:5000/app".to_string(),
            digest: "sha256:abc".to_string(),
        };
        assert_eq!(id.to_string(), "localhost:5000/app@sha256:abc");
        assert_eq!(id.digest(), "sha256:abc");
    }

    #[test]
    fn test_config_hash_is_deterministic() {
        let mut a = ConfigFile::for_platform(&Platform::linux_amd64());
        a.config.labels.insert("z".to_string(), "1".to_string());
        a.config.labels.insert("a".to_string(), "2".to_string());
        let mut b = ConfigFile::for_platform(&Platform::linux_amd64());
        b.config.labels.insert("a".to_string(), "2".to_string());
        b.config.labels.insert("z".to_string(), "1".to_string());

        let hash = config_hash(&a).unwrap();
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), "sha256:".len() + 64);
        assert_eq!(hash, config_hash(&b).unwrap());
        assert_eq!(Identifier::ConfigHash(hash.clone()).to_string(), hash);
    }

    #[test]
    fn test_config_hash_tracks_content() {
        let a = ConfigFile::for_platform(&Platform::linux_amd64());
        let b = ConfigFile::for_platform(&Platform::new("linux", "arm64"));
        assert_ne!(config_hash(&a).unwrap(), config_hash(&b).unwrap());
    }
}
