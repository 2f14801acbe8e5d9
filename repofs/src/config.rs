//! Repository configuration: shard size, cache capacities, `fail-stop`, and
//! an optional memcached-style remote cache endpoint. Loaded from an
//! optional TOML file, in the teacher's `config.rs` idiom but trimmed to
//! the much smaller surface a storage engine needs (no layered
//! user/repo/command-line stack).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheCapacities {
    #[serde(default = "default_cap")]
    pub revision_root_id: usize,
    #[serde(default = "default_cap")]
    pub dag_node: usize,
    #[serde(default = "default_cap")]
    pub dir_entries: usize,
    #[serde(default = "default_cap")]
    pub pack_manifest: usize,
    #[serde(default = "default_cap")]
    pub fulltext: usize,
}

fn default_cap() -> usize {
    1024
}

impl Default for CacheCapacities {
    fn default() -> Self {
        Self {
            revision_root_id: default_cap(),
            dag_node: default_cap(),
            dir_entries: default_cap(),
            pack_manifest: default_cap(),
            fulltext: default_cap(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Shard size used for newly created repositories (ignored when
    /// opening an existing one, whose `format` file already fixes it).
    pub shard_size: u64,
    pub caches: CacheCapacities,
    /// Elevate cache I/O errors (e.g. from the memcached tier) to hard
    /// errors instead of warn-and-swallow.
    pub fail_stop: bool,
    /// `host:port` of an optional memcached-style remote fulltext cache.
    pub memcached_endpoint: Option<String>,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            shard_size: 1000,
            caches: CacheCapacities::default(),
            fail_stop: false,
            memcached_endpoint: None,
        }
    }
}

impl FsConfig {
    pub fn load(path: &Path) -> FsResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| FsError::io(path, e))?;
        toml_edit::de::from_str(&text).map_err(|e| FsError::other(e))
    }

    pub fn load_optional(path: &Path) -> FsResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> FsResult<String> {
        toml_edit::ser::to_string_pretty(self).map_err(|e| FsError::other(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_sane() {
        let config = FsConfig::default();
        assert_eq!(config.shard_size, 1000);
        assert!(!config.fail_stop);
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repofs.toml");
        let mut config = FsConfig::default();
        config.fail_stop = true;
        config.shard_size = 500;
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = FsConfig::load(&path).unwrap();
        assert_eq!(loaded.shard_size, 500);
        assert!(loaded.fail_stop);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let loaded = FsConfig::load_optional(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(loaded.shard_size, 1000);
    }
}
