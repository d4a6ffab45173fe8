// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Region-map tunables loaded from JSON.

use std::path::Path;
use std::sync::Arc;

use log::warn;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default capacity of a region table.
pub const DEFAULT_MAX_REGIONS: usize = 4096;
/// Default minimal mapping granularity (4 KiB pages).
pub const DEFAULT_PAGE_SIZE_LOG2: u32 = 12;

const MIN_PAGE_SIZE_LOG2: u32 = 10;
const MAX_PAGE_SIZE_LOG2: u32 = 21;

/// Errors produced while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    /// The configuration is not valid JSON for [`Config`].
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    /// The configuration parsed but carries unusable values.
    #[error("config invalid: {0}")]
    Invalid(String),
}

/// Limits and diagnostics switches shared by all region maps of a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of region slots per region map.
    pub max_regions: usize,
    /// Log2 of the smallest mappable unit.
    pub page_size_log2: u32,
    /// Largest mapping the platform can install in one step, if limited.
    pub max_map_size_log2: Option<u32>,
    /// Trace attach and detach operations.
    pub verbose: bool,
    /// Trace every page fault handled by a pager.
    pub verbose_page_faults: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_regions: DEFAULT_MAX_REGIONS,
            page_size_log2: DEFAULT_PAGE_SIZE_LOG2,
            max_map_size_log2: None,
            verbose: false,
            verbose_page_faults: false,
        }
    }
}

impl Config {
    /// Parses and validates a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks that the limits describe a usable region map.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_regions == 0 {
            return Err(ConfigError::Invalid("max_regions must be non-zero".into()));
        }
        if !(MIN_PAGE_SIZE_LOG2..=MAX_PAGE_SIZE_LOG2).contains(&self.page_size_log2) {
            return Err(ConfigError::Invalid(format!(
                "page_size_log2 {} outside {MIN_PAGE_SIZE_LOG2}..={MAX_PAGE_SIZE_LOG2}",
                self.page_size_log2
            )));
        }
        if let Some(limit) = self.max_map_size_log2 {
            if limit < self.page_size_log2 || limit >= usize::BITS {
                return Err(ConfigError::Invalid(format!(
                    "max_map_size_log2 {limit} must lie in {}..{}",
                    self.page_size_log2,
                    usize::BITS
                )));
            }
        }
        Ok(())
    }

    /// Validates a configuration handed to a region map constructor.
    pub(crate) fn checked(config: Arc<Config>) -> crate::error::Result<Arc<Config>> {
        match config.validate() {
            Ok(()) => Ok(config),
            Err(err) => {
                warn!("rm: rejecting configuration: {err}");
                Err(crate::error::Error::InvalidConfig)
            }
        }
    }

    /// Size of the smallest mappable unit in bytes.
    pub fn page_size(&self) -> usize {
        1 << self.page_size_log2
    }

    /// Applies the platform limit to a mapping size.
    pub fn constrain_map_size_log2(&self, size_log2: u32) -> u32 {
        match self.max_map_size_log2 {
            Some(limit) => size_log2.min(limit),
            None => size_log2,
        }
    }

    pub(crate) fn align_up(&self, value: usize) -> Option<usize> {
        let mask = self.page_size() - 1;
        value.checked_add(mask).map(|v| v & !mask)
    }

    pub(crate) fn is_aligned(&self, value: usize) -> bool {
        value & (self.page_size() - 1) == 0
    }
}
