//! Default constants for crawler-sync configuration.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Remote Query Defaults
// =============================================================================

/// Number of leading characters of a long text value kept when an identifying
/// query is rejected and retried as a prefix (`LIKE`) match.
pub const DEFAULT_QUERY_PREFIX_LENGTH: usize = 200;

/// Maximum number of query results kept by the remote adapter's LRU cache.
/// The cache is cleared before every write phase.
pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 1024;

// =============================================================================
// Synchronization Defaults
// =============================================================================

/// Write to the remote unless the run is explicitly a dry run.
pub const DEFAULT_COMMIT_CHANGES: bool = true;

/// Ask the remote to reject inserts and updates that duplicate a name.
pub const DEFAULT_UNIQUE_NAMES: bool = true;

// =============================================================================
// Environment
// =============================================================================

/// Prefix of environment variables read by [`super::SyncConfig::load`].
/// Nested keys are separated by a double underscore, e.g.
/// `CRAWLER_SYNC_QUERY__PREFIX_LENGTH=120`.
pub const ENV_PREFIX: &str = "CRAWLER_SYNC_";
