//! Configuration for provenance tracking.
//!
//! Configuration is loaded with precedence: CLI overrides > Env vars > Config file > Defaults
//!
//! # Example config file (provenance.toml)
//! ```toml
//! data_dir = "/var/lib/provenance"
//!
//! [types.SourceableRecord]
//!
//! [types.CachedSourceableRecord]
//! cache_column = "sourced"
//!
//! [types.SourceableThroughRecord]
//! through = "item"
//!
//! [types.Material]
//! used_by = ["items", "discussions"]
//!
//! [types.Excerpt]
//! sourced_by = "documents"
//!
//! [storage]
//! write_buffer_mb = 64
//!
//! [gc]
//! log_each_repair = true
//! ```

mod defaults;
mod registry;

pub use defaults::*;
pub use registry::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration for the provenance registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvenanceConfig {
    /// Directory of the persistent registry; in-memory when unset
    pub data_dir: Option<PathBuf>,
    /// Sourceable types keyed by type name
    pub types: BTreeMap<String, SourceableOptions>,
    /// RocksDB storage tuning (advanced)
    pub storage: StorageConfig,
    /// Row lock striping for concurrent mutation
    pub locking: LockingConfig,
    /// Garbage collector behaviour
    pub gc: GcConfig,
}

impl ProvenanceConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment =
            Figment::new().merge(Serialized::defaults(ProvenanceConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Double underscore so type and option names keep their own underscores
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Registration options for one sourceable type.
///
/// `cache_column` and `through` are mutually exclusive; this is checked when the
/// [`TypeRegistry`] is built, not at deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceableOptions {
    /// Boolean attribute on the sourceable row mirroring "has a source"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_column: Option<String>,
    /// Association the sourced state is derived from (read-only sources)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub through: Option<String>,
    /// Associations that count toward `used`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub used_by: Vec<String>,
    /// Association whose targets' sources `update_sources` copies onto the record
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sourced_by: Option<String>,
}

impl SourceableOptions {
    pub fn cache_column(mut self, column: impl Into<String>) -> Self {
        self.cache_column = Some(column.into());
        self
    }

    pub fn through(mut self, association: impl Into<String>) -> Self {
        self.through = Some(association.into());
        self
    }

    pub fn sourced_by(mut self, association: impl Into<String>) -> Self {
        self.sourced_by = Some(association.into());
        self
    }

    pub fn used_by<I, A>(mut self, associations: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.used_by = associations.into_iter().map(Into::into).collect();
        self
    }
}

/// RocksDB storage configuration (advanced).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
    /// Maximum number of background compaction threads
    pub max_background_jobs: usize,
    /// Run RocksDB repair before opening
    pub repair: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
            repair: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Number of row lock stripes
    pub row_lock_stripes: usize,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            row_lock_stripes: DEFAULT_ROW_LOCK_STRIPES,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Log every removed or repaired entry at info level instead of debug
    pub log_each_repair: bool,
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
