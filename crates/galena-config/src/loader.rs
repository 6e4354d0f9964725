//! Configuration loader with multi-source merging.

use std::env;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::{GalenaConfig, Paths};

/// Builder-style loader; see the crate docs for precedence.
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "GALENA".to_string(),
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Config files in ascending precedence: user, then project, then the
    /// gitignored local override.
    fn config_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(user) = Paths::new().user_config_file() {
            files.push(user);
        }
        files.push(Paths::project_config_file(&self.project_dir));
        files.push(Paths::local_config_file(&self.project_dir));
        files
    }

    /// Merges all sources. Later sources win: defaults, then each config
    /// file in [`Self::config_files`] order, then `GALENA_*` environment
    /// variables on top.
    pub fn load(self) -> Result<GalenaConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&GalenaConfig::default())?);
        for file in self.config_files().into_iter().filter(|f| f.exists()) {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let mut loaded: GalenaConfig = builder.build()?.try_deserialize()?;
        loaded.resolve_paths(&self.project_dir);
        Ok(loaded)
    }

    /// Loads configuration or falls back to the defaults.
    pub fn load_or_default(self) -> GalenaConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_defaults() {
        let dir = tempdir().expect("temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .expect("load");

        assert_eq!(config.registry.host, "127.0.0.1");
        assert_eq!(config.runtime.pool_size, 1);
    }

    #[test]
    fn project_config_overrides_defaults() {
        let dir = tempdir().expect("temp dir");
        fs::write(
            dir.path().join("galena.toml"),
            r#"
[registry]
host = "registry.internal"

[node]
server_id = "SmallFS-node7"

[runtime]
pool_size = 4
"#,
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .expect("load");

        assert_eq!(config.registry.host, "registry.internal");
        assert_eq!(config.node.server_id, "SmallFS-node7");
        assert_eq!(config.runtime.pool_size, 4);
    }

    #[test]
    fn local_config_overrides_project_config() {
        let dir = tempdir().expect("temp dir");
        fs::write(dir.path().join("galena.toml"), "[registry]\nhost = \"a\"\n")
            .expect("write project config");
        fs::write(
            dir.path().join("galena.local.toml"),
            "[registry]\nhost = \"b\"\n",
        )
        .expect("write local config");

        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .expect("load");
        assert_eq!(config.registry.host, "b");
    }

    #[test]
    fn relative_data_root_is_resolved() {
        let dir = tempdir().expect("temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(dir.path())
            .load()
            .expect("load");
        assert!(config.node.data_root.is_absolute());
    }
}
