//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1` into structured components.
//! Registry and repository names are validated so a malformed destination is
//! rejected before anything is written.

use imgkit_core::error::{ImageError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "org/app")
    pub repository: String,
    /// Tag (e.g., "latest", "v1")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/image@sha256:abc...` → ghcr.io/org/image@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty image reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(invalid(reference, "expected digest as algorithm:hex"));
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Tag is the last colon after the last slash; a bare `host:port` is not a tag
        let (name, tag) = match name_tag.rfind('/') {
            Some(slash_pos) => {
                let after_slash = &name_tag[slash_pos + 1..];
                match after_slash.rfind(':') {
                    Some(colon_pos) => (
                        &name_tag[..slash_pos + 1 + colon_pos],
                        Some(after_slash[colon_pos + 1..].to_string()),
                    ),
                    None => (name_tag, None),
                }
            }
            None => match name_tag.rfind(':') {
                Some(colon_pos)
                    if digest.is_some()
                        || !name_tag[colon_pos + 1..].chars().all(|c| c.is_ascii_digit()) =>
                {
                    (
                        &name_tag[..colon_pos],
                        Some(name_tag[colon_pos + 1..].to_string()),
                    )
                }
                _ => (name_tag, None),
            },
        };

        let (registry, repository) = Self::split_registry_repository(name)
            .map_err(|message| invalid(reference, &message))?;
        validate_repository(&repository).map_err(|message| invalid(reference, &message))?;
        if let Some(ref tag) = tag {
            validate_tag(tag).map_err(|message| invalid(reference, &message))?;
        }

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> std::result::Result<(String, String), String> {
        // The first component is a registry when it looks like a hostname
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = &name[slash_pos + 1..];
                if repo.is_empty() {
                    return Err("empty repository".to_string());
                }
                return Ok((first.to_string(), repo.to_string()));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// `registry/repository` without tag or digest.
    pub fn context_name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// A copy of this reference pinned to `digest` (tag dropped).
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.context_name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Registry host a repository name resolves to, or the default registry when
/// the name does not parse.
pub fn registry_host(repo_name: &str) -> String {
    ImageReference::parse(repo_name)
        .map(|r| r.registry)
        .unwrap_or_else(|_| DEFAULT_REGISTRY.to_string())
}

fn invalid(reference: &str, message: &str) -> ImageError {
    ImageError::InvalidReference {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

/// Repository components: lowercase alphanumerics joined by `.`, `_`, `-`.
fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !valid {
            return Err(format!("invalid repository component {:?}", component));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !tag.starts_with(['.', '-']);
    if valid {
        Ok(())
    } else {
        Err(format!("invalid tag {:?}", tag))
    }
}
