// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration for the node identity table

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, FsResult};

/// Tunables for one mounted node table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeTableConfig {
    /// Number of independently locked table shards
    pub shards: usize,
    /// Declared range of fork (variant) indices per identifier
    pub fork_count: u32,
    /// Offer resolved names to the name cache
    pub name_cache: bool,
    /// Serve the well-known root id from the cached root vnode
    pub root_fast_path: bool,
}

impl Default for NodeTableConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            fork_count: 1,
            name_cache: true,
            root_fast_path: false,
        }
    }
}

impl NodeTableConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> FsResult<Self> {
        let config: Self = serde_json::from_slice(bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> FsResult<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_json_bytes(&bytes)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.shards == 0 || self.fork_count == 0 {
            return Err(FsError::InvalidArgument);
        }
        Ok(())
    }
}

/// Per-mount state the core needs from the host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountContext {
    /// Device number that scopes every node key of this mount
    pub device: u64,
}

impl MountContext {
    pub fn new(device: u64) -> Self {
        Self { device }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = NodeTableConfig::from_json_bytes(br#"{ "shards": 4 }"#).expect("config");
        assert_eq!(config.shards, 4);
        assert_eq!(config.fork_count, 1);
        assert!(config.name_cache);
        assert!(!config.root_fast_path);
    }

    #[test]
    fn zero_shards_rejected() {
        let err = NodeTableConfig::from_json_bytes(br#"{ "shards": 0 }"#).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
        let err = NodeTableConfig::from_json_bytes(br#"{ "fork_count": 0 }"#).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument));
    }

    #[test]
    fn malformed_json_is_config_error() {
        let err = NodeTableConfig::from_json_bytes(b"{ shards").unwrap_err();
        assert!(matches!(err, FsError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(br#"{ "name_cache": false, "root_fast_path": true }"#)
            .expect("write");
        let config = NodeTableConfig::load(file.path()).expect("load");
        assert!(!config.name_cache);
        assert!(config.root_fast_path);
        assert_eq!(config.shards, 16);
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = NodeTableConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(err.errno(), libc::ENOENT);
    }
}
