//! Attribute-level config edits.
//!
//! Each setter on an image handle is expressed as one [`ConfigEdit`] applied
//! to a clone of the current config. The original config is never touched.

use crate::model::{ConfigFile, ContainerConfig};

/// One field edit of an image config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigEdit {
    Env { key: String, value: String },
    Label { key: String, value: String },
    RemoveLabel(String),
    Cmd(Vec<String>),
    Entrypoint(Vec<String>),
    WorkingDir(String),
    Architecture(String),
    Os(String),
    OsVersion(String),
    Variant(String),
}

impl ConfigEdit {
    /// Short name used in logs.
    pub fn field(&self) -> &'static str {
        match self {
            ConfigEdit::Env { .. } => "env",
            ConfigEdit::Label { .. } => "label",
            ConfigEdit::RemoveLabel(_) => "remove_label",
            ConfigEdit::Cmd(_) => "cmd",
            ConfigEdit::Entrypoint(_) => "entrypoint",
            ConfigEdit::WorkingDir(_) => "working_dir",
            ConfigEdit::Architecture(_) => "architecture",
            ConfigEdit::Os(_) => "os",
            ConfigEdit::OsVersion(_) => "os_version",
            ConfigEdit::Variant(_) => "variant",
        }
    }

    /// Config with this edit applied.
    pub fn apply(&self, config: &ConfigFile) -> ConfigFile {
        let mut next = config.clone();
        match self {
            ConfigEdit::Architecture(value) => next.architecture = value.clone(),
            ConfigEdit::Os(value) => next.os = value.clone(),
            ConfigEdit::OsVersion(value) => next.os_version = value.clone(),
            ConfigEdit::Variant(value) => next.variant = value.clone(),
            _ => {
                let ignore_case = config.env_ignores_case();
                self.apply_container(&mut next.config, ignore_case);
            }
        }
        next
    }

    /// Apply to a runtime config sub-object; platform edits are ignored here.
    ///
    /// `ignore_case` selects case-insensitive env keys.
    pub fn apply_container(&self, config: &mut ContainerConfig, ignore_case: bool) {
        match self {
            ConfigEdit::Env { key, value } => config.set_env(key, value, ignore_case),
            ConfigEdit::Label { key, value } => {
                config.labels.insert(key.clone(), value.clone());
            }
            ConfigEdit::RemoveLabel(key) => {
                config.labels.remove(key);
            }
            ConfigEdit::Cmd(cmd) => config.cmd = cmd.clone(),
            ConfigEdit::Entrypoint(entrypoint) => config.entrypoint = entrypoint.clone(),
            ConfigEdit::WorkingDir(dir) => config.working_dir = dir.clone(),
            ConfigEdit::Architecture(_)
            | ConfigEdit::Os(_)
            | ConfigEdit::OsVersion(_)
            | ConfigEdit::Variant(_) => {}
        }
    }
}
