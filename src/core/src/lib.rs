//! imgkit Core - Foundational Types
//!
//! Error taxonomy, registry configuration and tracing setup shared by
//! every image backend.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{RegistrySetting, RegistrySettings};
pub use error::{ImageError, Result, SaveDiagnostic, SaveError};
pub use log::{init_tracing, LogFormat};

/// imgkit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
