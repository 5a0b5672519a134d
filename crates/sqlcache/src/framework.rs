//! Collaborator traits the host cache framework is expected to supply.
//!
//! These are the "out of scope" boundaries `spec.md` calls out: the core
//! round-trips whatever these traits hand it without ever parsing the
//! payload itself.

use std::time::SystemTime;

use sqlcache_core::ErrorHandler;

/// The opaque, in-transit cache entry the host framework owns. The core
/// never parses `value`; it only asks whether the entry has expired or
/// carries a stale version tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub expires_at: Option<SystemTime>,
    pub version: Option<String>,
}

impl CacheEntry {
    #[must_use]
    pub fn new(value: Vec<u8>) -> Self {
        Self { value, expires_at: None, version: None }
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: SystemTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= SystemTime::now())
    }

    #[must_use]
    pub fn is_mismatched(&self, expected_version: Option<&str>) -> bool {
        match (self.version.as_deref(), expected_version) {
            (Some(stored), Some(expected)) => stored != expected,
            _ => false,
        }
    }
}

/// Converts a [`CacheEntry`] to and from the bytes stored in the `value`
/// column. Supplied by the host cache framework (its entry serialization
/// format is explicitly out of scope for this crate).
pub trait EntrySerializer: Send + Sync {
    /// Serialization errors are framework-specific and opaque to the
    /// core; they're reported as a string so callers don't need to name
    /// a concrete error type here.
    fn serialize(&self, entry: &CacheEntry) -> Result<Vec<u8>, String>;

    /// Returns `None` on any deserialization failure. The read path
    /// treats that the same as a version mismatch: the entry is silently
    /// dropped rather than surfaced as an error.
    fn deserialize(&self, bytes: &[u8]) -> Option<CacheEntry>;
}

/// A serializer with no framing at all: the entry's raw value bytes are
/// stored and read back verbatim, with no expiry or version metadata.
/// Useful for tests and for hosts that manage expiry entirely through
/// `max_age`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawBytesSerializer;

impl EntrySerializer for RawBytesSerializer {
    fn serialize(&self, entry: &CacheEntry) -> Result<Vec<u8>, String> {
        Ok(entry.value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> Option<CacheEntry> {
        Some(CacheEntry::new(bytes.to_vec()))
    }
}

/// Encrypts/decrypts the `value` column. Supplied by the storage
/// framework; `sqlcache` only calls through it and charges the larger
/// per-row overhead when it's present.
pub trait EncryptionWrapper: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, String>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, String>;
}

/// Receives warnings for errors the failsafe envelope swallowed, in
/// addition to the `error_handler` callback. Distinct from
/// [`ErrorHandler`] because a reporter is typically wired to an
/// observability backend (severity, tags) rather than application logic.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, tag: &'static str, message: &str);
}

/// An [`ErrorReporter`] that only emits a `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, tag: &'static str, message: &str) {
        tracing::warn!(tag, message, "reported by failsafe envelope");
    }
}

/// Counters a host can plug in for cache hits/misses/writes/evictions.
/// Default is a no-op; the call sites exist in the core regardless of
/// whether a sink is attached (the sink is external, the instrumentation
/// points are not).
pub trait StatsSink: Send + Sync {
    fn record_hit(&self) {}
    fn record_miss(&self) {}
    fn record_write(&self, count: u64) {
        let _ = count;
    }
    fn record_eviction(&self, count: u64) {
        let _ = count;
    }
}

/// A [`StatsSink`] that does nothing, used when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {}

/// Bridges [`ErrorHandler`] (the `sqlcache-core` trait the failsafe
/// envelope calls) to an [`ErrorReporter`], so a swallowed error reaches
/// both an error-reporter and an error-handler callback.
pub struct ReportingErrorHandler<R: ErrorReporter> {
    reporter: R,
}

impl<R: ErrorReporter> ReportingErrorHandler<R> {
    #[must_use]
    pub fn new(reporter: R) -> Self {
        Self { reporter }
    }
}

impl<R: ErrorReporter> ErrorHandler for ReportingErrorHandler<R> {
    fn handle(&self, tag: &'static str, error: &sqlcache_core::Error) {
        self.reporter.report(tag, &error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn raw_bytes_serializer_round_trips() {
        let serializer = RawBytesSerializer;
        let entry = CacheEntry::new(b"hello".to_vec());
        let bytes = serializer.serialize(&entry).unwrap();
        let restored = serializer.deserialize(&bytes).unwrap();
        assert_eq!(restored.value, b"hello");
    }

    #[test]
    fn expiry_is_detected() {
        let past = SystemTime::now() - Duration::from_secs(10);
        let entry = CacheEntry::new(vec![]).with_expiry(past);
        assert!(entry.is_expired());
    }

    #[test]
    fn version_mismatch_is_detected() {
        let entry = CacheEntry::new(vec![]).with_version("v1");
        assert!(entry.is_mismatched(Some("v2")));
        assert!(!entry.is_mismatched(Some("v1")));
        assert!(!entry.is_mismatched(None));
    }
}
