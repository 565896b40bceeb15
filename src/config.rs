//! Engine configuration
//!
//! Loaded from TOML or built in code. Every field has a default, so an
//! empty file is a valid configuration.
//!
//! ```toml
//! store_bits = 4
//! collision_bits = 6
//! patch_mode = "always-copy"
//! report_leaks = true
//! ```

use crate::error::InterceptError;
use crate::keyed_store::{DEFAULT_BITS, MAX_BITS, MIN_BITS};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// How indirect instrumentors decide between patching a table in place
/// and repointing objects at a private copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PatchMode {
    /// Copy tables that live inside a loaded image, patch the rest in place
    #[default]
    Auto,
    /// Always repoint objects at a private patched copy
    AlwaysCopy,
    /// Always patch the shared table itself (null tables are still copied)
    InPlace,
}

/// Configuration shared by every interceptor created from one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Bucket bits for per-instrumentor stores (2^bits buckets)
    pub store_bits: u8,

    /// Bucket bits for the two collision sets
    pub collision_bits: u8,

    /// Default patch policy for new interceptors
    pub patch_mode: PatchMode,

    /// Log entries still present when stores are torn down
    pub report_leaks: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_bits: DEFAULT_BITS,
            collision_bits: DEFAULT_BITS,
            patch_mode: PatchMode::Auto,
            report_leaks: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text (not validated)
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse engine configuration")
    }

    /// Load and validate a configuration file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read config file: {}", path.as_ref().display())
        })?;
        let config = Self::from_toml_str(&content)?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), InterceptError> {
        for (name, bits) in [
            ("store_bits", self.store_bits),
            ("collision_bits", self.collision_bits),
        ] {
            if !(MIN_BITS..=MAX_BITS).contains(&bits) {
                return Err(InterceptError::Config(format!(
                    "{} must be in [{}, {}], got {}",
                    name, MIN_BITS, MAX_BITS, bits
                )));
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize engine configuration")
    }
}
