//! Configuration shape. Loading a config file from disk or environment
//! variables is host-integration's job; this module only defines the
//! fields and their documented defaults.

use std::time::Duration;

use sqlcache_core::{ClearWith, ExpiryMethod};

/// Declares the shard topology. `database`, `databases`, and
/// `connects_to` in the cache framework's own configuration are mutually
/// exclusive; this enum models that exclusivity directly rather than as
/// three optional fields that must be validated against each other.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ShardTopology {
    /// `database`: a single unmanaged connection.
    Unmanaged,
    /// `connects_to`: one named shard.
    Single(String),
    /// `databases`: multiple named shards, routed by Maglev.
    Sharded(Vec<String>),
}

impl Default for ShardTopology {
    fn default() -> Self {
        ShardTopology::Unmanaged
    }
}

/// Mirrors every row of the configuration table: shard topology, key
/// handling, eviction bounds, and the storage-framework passthroughs.
///
/// `error_handler` and `executor` (the host-runtime task wrapper) are
/// deliberately not fields here: both are behavior, not data, and belong
/// as explicit constructor arguments when a host builds a
/// [`crate::store::Store`], not as `Deserialize`d configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shard topology: `database` / `databases` / `connects_to`.
    pub topology: ShardTopology,

    /// Subset of configured shards this store actually uses. `None`
    /// means all shards named in `topology`.
    pub shards: Option<Vec<String>>,

    /// Opaque passthrough to the cache-framework base; the core never
    /// inspects it.
    pub store_options: serde_json::Value,

    /// Cap on a normalized key's byte length.
    pub max_key_bytesize: usize,

    /// Optional prefix applied to every key before normalization and
    /// hashing.
    pub namespace: Option<String>,

    /// How `clear` empties a shard's table.
    pub clear_with: ClearWith,

    /// Maximum entry age before it becomes an eviction candidate.
    pub max_age: Option<Duration>,

    /// Maximum row count (approximated via `id_range`) before the cache
    /// is considered full.
    pub max_entries: Option<i64>,

    /// Maximum total byte size (approximated via the size estimator)
    /// before the cache is considered full.
    pub max_size: Option<i64>,

    /// Rows targeted per eviction batch.
    pub expiry_batch_size: i64,

    /// Ratio of eviction rate to write rate.
    pub expiry_multiplier: f64,

    /// Where eviction batches run.
    pub expiry_method: ExpiryMethod,

    /// Job queue name, used when `expiry_method` is [`ExpiryMethod::Job`].
    pub expiry_queue: Option<String>,

    /// Sample count for the size estimator.
    pub size_estimate_samples: usize,

    /// Enables value encryption. The encryption implementation itself is
    /// an external collaborator; this only flips the byte-size overhead
    /// accounting and the storage-framework's encryption wrapper on.
    pub encrypt: bool,

    /// Opaque encryption-context properties passed through to the
    /// encryption collaborator when `encrypt` is set.
    pub encryption_context_properties: Option<serde_json::Value>,

    /// When false, suppresses `tracing` spans around SQL calls (maps to
    /// the storage driver's own query-logging toggle in the source
    /// system). Logging elsewhere in the engine is unaffected.
    pub active_record_instrumentation: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topology: ShardTopology::default(),
            shards: None,
            store_options: serde_json::Value::Null,
            max_key_bytesize: sqlcache_core::DEFAULT_MAX_KEY_BYTESIZE,
            namespace: None,
            clear_with: ClearWith::Delete,
            max_age: Some(sqlcache_core::expiry::DEFAULT_MAX_AGE),
            max_entries: None,
            max_size: None,
            expiry_batch_size: sqlcache_core::expiry::DEFAULT_BATCH_SIZE,
            expiry_multiplier: sqlcache_core::expiry::DEFAULT_MULTIPLIER,
            expiry_method: ExpiryMethod::Thread,
            expiry_queue: None,
            size_estimate_samples: sqlcache_core::expiry::DEFAULT_SIZE_ESTIMATE_SAMPLES,
            encrypt: false,
            encryption_context_properties: None,
            active_record_instrumentation: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_key_bytesize, 1024);
        assert_eq!(config.expiry_batch_size, 100);
        assert_eq!(config.size_estimate_samples, 10_000);
        assert!(!config.encrypt);
        assert!(config.active_record_instrumentation);
        assert_eq!(config.max_age, Some(Duration::from_secs(14 * 24 * 60 * 60)));
    }
}
