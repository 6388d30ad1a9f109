//! Default constants for provenance configuration.

/// Prefix for environment overrides, e.g. `PROVENANCE_DATA_DIR`
pub const ENV_PREFIX: &str = "PROVENANCE_";

// =============================================================================
// Storage Defaults (RocksDB)
// =============================================================================

/// Default write buffer size in MB
pub const DEFAULT_WRITE_BUFFER_MB: usize = 64;

/// Default number of background compaction jobs
pub const DEFAULT_BACKGROUND_JOBS: usize = 2;

// =============================================================================
// Concurrency Defaults
// =============================================================================

/// Default number of row lock stripes.
/// Two records hashing to the same stripe serialize their mutations.
pub const DEFAULT_ROW_LOCK_STRIPES: usize = 64;
