// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration, loadable from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::container::DEFAULT_MAX_MANIFEST_BYTES;
use crate::error::{Error, Result as PayloadResult};
use crate::manifest::{Manifest, PartitionKind};
use crate::signature::{Scheme, SchemeRegistry};

pub const DEFAULT_KERNEL_PART_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_ROOT_PART_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// What ZERO/DISCARD operations do to their destination extents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroPolicy {
    /// Write zero bytes.
    #[default]
    Fill,
    /// Leave the blocks as they are. Targets are created zeroed, so this only
    /// differs from `Fill` on reused images.
    Skip,
}

/// Physical partition sizes a payload's images must fit in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLimits {
    pub kernel: u64,
    pub root: u64,
}

impl Default for PartitionLimits {
    fn default() -> Self {
        Self { kernel: DEFAULT_KERNEL_PART_SIZE, root: DEFAULT_ROOT_PART_SIZE }
    }
}

impl PartitionLimits {
    pub fn for_kind(&self, kind: PartitionKind) -> u64 {
        match kind {
            PartitionKind::Kernel => self.kernel,
            PartitionKind::Root => self.root,
        }
    }

    /// Every old and new image declared by `manifest` must fit its partition.
    pub fn check(&self, manifest: &Manifest) -> PayloadResult<()> {
        for part in &manifest.partitions {
            let limit = self.for_kind(part.kind);
            let largest = part.new_size.max(part.old_size.unwrap_or(0));
            if largest > limit {
                return Err(Error::malformed_manifest(format!(
                    "{}: image of {largest} bytes exceeds partition size {limit}",
                    part.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Block size the payload is expected to declare.
    pub block_size: Option<u32>,
    /// Accept data-carrying operations without a data hash.
    pub allow_unhashed: bool,
    pub zero_policy: ZeroPolicy,
    /// Apply kernel and root on separate threads.
    pub parallel_partitions: bool,
    /// Hash-check old images before a delta apply.
    pub verify_source: bool,
    pub kernel_part_size: u64,
    pub root_part_size: u64,
    pub max_manifest_size: u64,
    #[serde(rename = "scheme")]
    pub schemes: Vec<Scheme>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_size: None,
            allow_unhashed: false,
            zero_policy: ZeroPolicy::Fill,
            parallel_partitions: false,
            verify_source: true,
            kernel_part_size: DEFAULT_KERNEL_PART_SIZE,
            root_part_size: DEFAULT_ROOT_PART_SIZE,
            max_manifest_size: DEFAULT_MAX_MANIFEST_BYTES,
            schemes: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml(&text, path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(bs) = self.block_size {
            if !bs.is_power_of_two() {
                return Err(ConfigError::Invalid(format!("block_size {bs} is not a power of two")));
            }
        }
        if self.max_manifest_size == 0 {
            return Err(ConfigError::Invalid("max_manifest_size must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn registry(&self) -> SchemeRegistry {
        SchemeRegistry::with_overrides(&self.schemes)
    }

    pub fn limits(&self) -> PartitionLimits {
        PartitionLimits { kernel: self.kernel_part_size, root: self.root_part_size }
    }

    /// Physical size limit of a partition.
    pub fn part_size(&self, kind: PartitionKind) -> u64 {
        self.limits().for_kind(kind)
    }
}
