//! Well-known configuration file locations.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{ConfigError, Result};

/// Resolver for the standard config file locations.
#[derive(Default)]
pub struct Paths;

impl Paths {
    pub fn new() -> Self {
        Self
    }

    /// The per-user config file (`~/.config/galena/config.toml` on Linux).
    pub fn user_config_file(&self) -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "galena").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// The project config file.
    pub fn project_config_file(project_dir: &Path) -> PathBuf {
        project_dir.join("galena.toml")
    }

    /// The gitignored local override file.
    pub fn local_config_file(project_dir: &Path) -> PathBuf {
        project_dir.join("galena.local.toml")
    }
}
