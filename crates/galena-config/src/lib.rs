//! # galena-config: layered configuration
//!
//! Loads a [`GalenaConfig`] by merging, in precedence order: built-in
//! defaults, the user config file, the project `galena.toml`, the
//! gitignored `galena.local.toml`, and `GALENA_*` environment variables.
//!
//! The mandatory process inputs are here: the registry host, the data
//! root, and the server id (`<group>-<node>`). Everything else is a
//! tunable with a sensible default.

pub mod error;
pub mod loader;
pub mod paths;

pub use error::{ConfigError, Result};
pub use loader::ConfigLoader;
pub use paths::Paths;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// The RPC registry to resolve addresses against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry host name or address.
    pub host: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
        }
    }
}

/// This process's identity and storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Root of the data tree; each node keeps its subtree under it.
    pub data_root: PathBuf,

    /// Process-level server id, `<group>-<node>`.
    pub server_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            server_id: "SmallFS-node1".to_string(),
        }
    }
}

/// Runtime tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads in the process pool. One is enough: the pool is a
    /// serialization point, not a throughput device.
    pub pool_size: usize,

    /// Byte size at which a replication-log segment is retired.
    pub segment_limit: u64,

    /// Live instances the capability dictionary keeps cached.
    pub cache_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            segment_limit: 10 * 1024 * 1024,
            cache_capacity: 128,
        }
    }
}

/// The full process configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GalenaConfig {
    pub registry: RegistryConfig,
    pub node: NodeConfig,
    pub runtime: RuntimeConfig,
}

impl GalenaConfig {
    /// Resolves relative paths against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.node.data_root.is_relative() {
            self.node.data_root = base.join(&self.node.data_root);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = GalenaConfig::default();
        assert_eq!(config.runtime.pool_size, 1);
        assert_eq!(config.runtime.segment_limit, 10 * 1024 * 1024);
        assert_eq!(config.node.server_id, "SmallFS-node1");
    }

    #[test]
    fn resolve_makes_the_data_root_absolute() {
        let mut config = GalenaConfig::default();
        config.resolve_paths(Path::new("/srv/galena"));
        assert_eq!(config.node.data_root, PathBuf::from("/srv/galena/data"));
    }
}
