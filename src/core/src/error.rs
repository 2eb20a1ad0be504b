use std::fmt;

use thiserror::Error;

/// imgkit error types
#[derive(Error, Debug)]
pub enum ImageError {
    /// The image config could not be retrieved
    #[error("Config unavailable for image {image:?}: {message}")]
    ConfigUnavailable { image: String, message: String },

    /// A required config field (architecture, OS) is empty
    #[error("Missing {field} for image {image:?}")]
    MissingRequiredField { image: String, field: &'static str },

    /// Layer lookup by diff ID missed
    #[error("Image {image:?} has no layer with diff ID {diff_id:?}")]
    LayerNotFound { image: String, diff_id: String },

    /// Rebase could not find the top base layer in the receiver
    #[error("Rebase of {image:?} failed: no base layer with diff ID {diff_id:?}")]
    BaseLayerNotFound { image: String, diff_id: String },

    /// Rebase onto a base from another backend
    #[error("Rebase of {image:?} failed: new base {base:?} is not a {expected} image")]
    IncompatibleBase {
        image: String,
        base: String,
        expected: &'static str,
    },

    /// One or more save destinations failed
    #[error(transparent)]
    Save(#[from] SaveError),

    /// Operation intentionally unsupported by a backend
    #[error("{operation} is not implemented for {backend} images")]
    NotImplemented {
        operation: &'static str,
        backend: &'static str,
    },

    /// Manifest or index failed a structural check
    #[error("Validation failed for {subject}: {message}")]
    ValidationFailed { subject: String, message: String },

    /// Registry rejected the credentials
    #[error("Registry unauthorized: {registry} - {message}")]
    Unauthorized { registry: String, message: String },

    /// Registry denied access for valid credentials
    #[error("Registry forbidden: {registry} - {message}")]
    Forbidden { registry: String, message: String },

    /// Container registry error
    #[error("Registry error: {registry} - {message}")]
    Registry { registry: String, message: String },

    /// Container engine daemon error
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// On-disk layout error
    #[error("Layout error at {path}: {message}")]
    Layout { path: String, message: String },

    /// Malformed image reference
    #[error("Invalid reference {reference:?}: {message}")]
    InvalidReference { reference: String, message: String },

    /// Media type cannot be mapped to the requested dialect
    #[error("Media type error: {0}")]
    MediaType(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ImageError {
    /// Whether the registry refused access (401 or 403).
    pub fn is_access_denied(&self) -> bool {
        matches!(
            self,
            ImageError::Unauthorized { .. } | ImageError::Forbidden { .. }
        )
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImageError {
    fn from(err: serde_yaml::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

/// A single failed save destination.
#[derive(Debug)]
pub struct SaveDiagnostic {
    /// Destination name or path that failed
    pub image_name: String,
    /// Why it failed
    pub cause: Box<ImageError>,
}

/// Aggregate of every destination that failed during a multi-destination save.
///
/// Destinations not listed here were written successfully.
#[derive(Debug, Error)]
pub struct SaveError {
    pub errors: Vec<SaveDiagnostic>,
}

impl SaveError {
    /// Names of the failed destinations, in the order they were attempted.
    pub fn failed_names(&self) -> Vec<&str> {
        self.errors.iter().map(|d| d.image_name.as_str()).collect()
    }
}

impl fmt::Display for SaveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to write image to the following destinations:")?;
        for diagnostic in &self.errors {
            write!(f, " [{}: {}]", diagnostic.image_name, diagnostic.cause)?;
        }
        Ok(())
    }
}

/// Result type alias for imgkit operations
pub type Result<T> = std::result::Result<T, ImageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_unavailable_display() {
        let error = ImageError::ConfigUnavailable {
            image: "registry.local/app".to_string(),
            message: "blob missing".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Config unavailable for image \"registry.local/app\": blob missing"
        );
    }

    #[test]
    fn test_missing_required_field_display() {
        let error = ImageError::MissingRequiredField {
            image: "app".to_string(),
            field: "Architecture",
        };
        assert_eq!(error.to_string(), "Missing Architecture for image \"app\"");
    }

    #[test]
    fn test_layer_not_found_names_diff_id() {
        let error = ImageError::LayerNotFound {
            image: "app".to_string(),
            diff_id: "sha256:doesnotexist".to_string(),
        };
        assert!(error.to_string().contains("sha256:doesnotexist"));
        assert!(error.to_string().contains("app"));
    }

    #[test]
    fn test_incompatible_base_display() {
        let error = ImageError::IncompatibleBase {
            image: "app".to_string(),
            base: "other".to_string(),
            expected: "remote",
        };
        assert_eq!(
            error.to_string(),
            "Rebase of \"app\" failed: new base \"other\" is not a remote image"
        );
    }

    #[test]
    fn test_not_implemented_display() {
        let error = ImageError::NotImplemented {
            operation: "AnnotateRefName",
            backend: "remote",
        };
        assert_eq!(
            error.to_string(),
            "AnnotateRefName is not implemented for remote images"
        );
    }

    #[test]
    fn test_save_error_lists_every_destination() {
        let error = SaveError {
            errors: vec![
                SaveDiagnostic {
                    image_name: "bad::name".to_string(),
                    cause: Box::new(ImageError::InvalidReference {
                        reference: "bad::name".to_string(),
                        message: "invalid repository".to_string(),
                    }),
                },
                SaveDiagnostic {
                    image_name: "other/name".to_string(),
                    cause: Box::new(ImageError::Daemon("tag failed".to_string())),
                },
            ],
        };
        assert_eq!(error.failed_names(), vec!["bad::name", "other/name"]);
        let display = error.to_string();
        assert!(display.contains("[bad::name: Invalid reference"));
        assert!(display.contains("[other/name: Daemon error: tag failed]"));

        let wrapped: ImageError = error.into();
        assert!(matches!(wrapped, ImageError::Save(_)));
    }

    #[test]
    fn test_access_denied() {
        let unauthorized = ImageError::Unauthorized {
            registry: "ghcr.io".to_string(),
            message: "401".to_string(),
        };
        let forbidden = ImageError::Forbidden {
            registry: "ghcr.io".to_string(),
            message: "403".to_string(),
        };
        let other = ImageError::Registry {
            registry: "ghcr.io".to_string(),
            message: "500".to_string(),
        };
        assert!(unauthorized.is_access_denied());
        assert!(forbidden.is_access_denied());
        assert!(!other.is_access_denied());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ImageError = io_error.into();
        assert!(matches!(error, ImageError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let error: ImageError = result.unwrap_err().into();
        assert!(matches!(error, ImageError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: ImageError = result.unwrap_err().into();
        assert!(matches!(error, ImageError::Serialization(_)));
    }
}
