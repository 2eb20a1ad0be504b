//! The capability trait every backend implements.

use std::any::Any;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use imgkit_core::error::{ImageError, Result};

use crate::identity::Identifier;
use crate::model::{normalized_date_time, ConfigFile};
use crate::mutate::ConfigEdit;

/// An open image in some backend.
///
/// Getters read the current config; setters go through [`Image::apply_edit`],
/// which installs a new underlying value rather than editing in place.
pub trait Image: Any + Send {
    /// Repository name or path the image was opened under.
    fn name(&self) -> &str;

    /// Change the name used by [`Image::save`]. Nothing is written.
    fn rename(&mut self, name: &str);

    /// Backend family, e.g. `"remote"`.
    fn kind(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Current config, or `ConfigUnavailable`.
    fn config_file(&self) -> Result<Arc<ConfigFile>>;

    /// Apply one config edit copy-on-write.
    fn apply_edit(&mut self, edit: ConfigEdit) -> Result<()>;

    /// Whether the image exists in its backend.
    fn found(&self) -> bool;

    /// Whether the stored image passes structural validation.
    fn valid(&self) -> bool;

    fn identifier(&self) -> Result<Identifier>;

    fn manifest_size(&self) -> Result<i64>;

    /// Diff ID of the topmost layer.
    fn top_layer(&self) -> Result<String>;

    /// Uncompressed tar stream of one of this image's layers.
    fn get_layer(&self, diff_id: &str) -> Result<Box<dyn Read + Send>>;

    /// Append a layer read from `path` (tar or tar.gz).
    fn add_layer(&mut self, path: &Path) -> Result<()>;

    /// Append a layer whose diff ID the caller already knows.
    fn add_layer_with_diff_id(&mut self, path: &Path, diff_id: &str) -> Result<()> {
        let _ = diff_id;
        self.add_layer(path)
    }

    /// Append a layer of the previous image by diff ID.
    fn reuse_layer(&mut self, diff_id: &str) -> Result<()>;

    /// Replace every layer up to and including `top_diff_id` with the layers
    /// of `new_base`, which must be of the same backend family.
    fn rebase(&mut self, top_diff_id: &str, new_base: &dyn Image) -> Result<()>;

    fn annotate_ref_name(&mut self, ref_name: &str) -> Result<()>;

    fn get_annotate_ref_name(&self) -> Result<String>;

    /// Write the image under `name` and every name in `additional`.
    fn save_as(&mut self, name: &str, additional: &[&str]) -> Result<()>;

    /// [`Image::save_as`] under the current name.
    fn save(&mut self, additional: &[&str]) -> Result<()> {
        let name = self.name().to_string();
        self.save_as(&name, additional)
    }

    /// Remove the image from its backend.
    fn delete(&mut self) -> Result<()>;

    fn architecture(&self) -> Result<String> {
        let config = self.config_file()?;
        required(self.name(), "Architecture", &config.architecture)
    }

    fn os(&self) -> Result<String> {
        let config = self.config_file()?;
        required(self.name(), "OS", &config.os)
    }

    fn os_version(&self) -> Result<String> {
        Ok(self.config_file()?.os_version.clone())
    }

    fn variant(&self) -> Result<String> {
        Ok(self.config_file()?.variant.clone())
    }

    /// Value of an environment variable, `""` when unset.
    fn env(&self, key: &str) -> Result<String> {
        let config = self.config_file()?;
        Ok(config
            .config
            .env_var(key, config.env_ignores_case())
            .unwrap_or_default()
            .to_string())
    }

    fn label(&self, key: &str) -> Result<String> {
        Ok(self
            .config_file()?
            .config
            .labels
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    fn labels(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.config_file()?.config.labels.clone())
    }

    fn entrypoint(&self) -> Result<Vec<String>> {
        Ok(self.config_file()?.config.entrypoint.clone())
    }

    fn cmd(&self) -> Result<Vec<String>> {
        Ok(self.config_file()?.config.cmd.clone())
    }

    fn working_dir(&self) -> Result<String> {
        Ok(self.config_file()?.config.working_dir.clone())
    }

    /// Creation time recorded in the config.
    fn created_at(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .config_file()?
            .created
            .unwrap_or_else(normalized_date_time))
    }

    fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::Env {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::Label {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn remove_label(&mut self, key: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::RemoveLabel(key.to_string()))
    }

    fn set_cmd(&mut self, cmd: &[&str]) -> Result<()> {
        self.apply_edit(ConfigEdit::Cmd(owned(cmd)))
    }

    fn set_entrypoint(&mut self, entrypoint: &[&str]) -> Result<()> {
        self.apply_edit(ConfigEdit::Entrypoint(owned(entrypoint)))
    }

    fn set_working_dir(&mut self, dir: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::WorkingDir(dir.to_string()))
    }

    fn set_architecture(&mut self, architecture: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::Architecture(architecture.to_string()))
    }

    fn set_os(&mut self, os: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::Os(os.to_string()))
    }

    fn set_os_version(&mut self, os_version: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::OsVersion(os_version.to_string()))
    }

    fn set_variant(&mut self, variant: &str) -> Result<()> {
        self.apply_edit(ConfigEdit::Variant(variant.to_string()))
    }
}

fn required(image: &str, field: &'static str, value: &str) -> Result<String> {
    if value.is_empty() {
        return Err(ImageError::MissingRequiredField {
            image: image.to_string(),
            field,
        });
    }
    Ok(value.to_string())
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Downcast a rebase base to the receiver's concrete type.
pub(crate) fn same_family<'a, T: Image>(
    image: &str,
    expected: &'static str,
    new_base: &'a dyn Image,
) -> Result<&'a T> {
    new_base
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| ImageError::IncompatibleBase {
            image: image.to_string(),
            base: new_base.name().to_string(),
            expected,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required() {
        assert_eq!(required("app", "OS", "linux").unwrap(), "linux");
        let err = required("app", "OS", "").unwrap_err();
        assert_eq!(err.to_string(), "Missing OS for image \"app\"");
    }

    #[test]
    fn test_owned() {
        assert_eq!(owned(&["a", "b"]), vec!["a".to_string(), "b".to_string()]);
    }
}
