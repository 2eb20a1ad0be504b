//! Container image construction and mutation over three storage backends.
//!
//! The same build sequence (open a base, add or reuse layers, edit the config,
//! rebase, save under one or more names) runs against:
//!
//! - [`remote::RemoteImage`]: an image in a container registry
//! - [`local::LocalImage`]: an image in a local container-engine daemon
//! - [`layout::LayoutImage`]: an OCI image layout directory
//!
//! All three implement [`Image`]. Built from the same inputs with the same
//! `created_at`, they produce the same config and layer content.

pub mod identity;
pub mod image;
pub mod layer;
pub mod layout;
pub mod local;
pub mod media;
pub mod model;
pub mod mutate;
pub mod rebase;
pub mod reference;
pub mod remote;
pub mod save;
pub mod validate;
pub mod value;

pub use identity::Identifier;
pub use image::Image;
pub use layer::Layer;
pub use layout::{LayoutImage, LayoutOptions};
pub use local::{LocalImage, LocalOptions};
pub use media::MediaTypes;
pub use model::{normalized_date_time, ConfigFile, Platform};
pub use reference::ImageReference;
pub use remote::{RemoteImage, RemoteOptions};

pub use imgkit_core::error::{ImageError, Result, SaveDiagnostic, SaveError};
