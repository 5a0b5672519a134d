//! The `entries` row type and the byte-size estimator it carries.

use crate::key::hash_key;

/// Row overhead charged against `byte_size` for an unencrypted entry:
/// approximates the fixed cost of the row beyond its key and value bytes
/// (index entry, row header, timestamp column).
pub const BASE_OVERHEAD_BYTES: i64 = 140;

/// Row overhead charged when the value column holds encrypted bytes,
/// which carry a nonce/tag alongside the ciphertext.
pub const ENCRYPTED_OVERHEAD_BYTES: i64 = 310;

/// One row of the `entries` table.
///
/// `created_at_millis` is milliseconds since the Unix epoch rather than a
/// `chrono::DateTime`: `sqlx::Any` (the driver this repository is built
/// on so one code path speaks both Postgres and SQLite) only implements
/// `Type`/`Encode`/`Decode` for a fixed scalar set
/// (`bool`/`i16`/`i32`/`i64`/`f32`/`f64`/`String`/`Vec<u8>`); the `chrono`
/// feature wires `chrono` types up for the concrete backend drivers, not
/// for `Any`. Storing the timestamp as a plain `i64` keeps it portable
/// across both; [`EntryRow::created_at`] converts it back at the edge.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct EntryRow {
    pub id: i64,
    pub key_hash: i64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub byte_size: i64,
    #[sqlx(rename = "created_at")]
    pub created_at_millis: i64,
}

impl EntryRow {
    /// `created_at_millis` as a `chrono::DateTime<Utc>`, for callers that
    /// want calendar arithmetic rather than a raw millisecond count.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.created_at_millis).unwrap_or_else(chrono::Utc::now)
    }
}

/// The current time as milliseconds since the Unix epoch, in the same
/// representation `entries.created_at` is stored as.
#[must_use]
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A key/value pair ready to be upserted. Computes its own `key_hash` and
/// `byte_size` on demand rather than carrying them as separate fields, so
/// callers can't construct an inconsistent payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub encrypted: bool,
}

impl Payload {
    #[must_use]
    pub fn new(key: Vec<u8>, value: Vec<u8>, encrypted: bool) -> Self {
        Self { key, value, encrypted }
    }

    /// The signed 64-bit key hash this payload will be stored under.
    #[must_use]
    pub fn key_hash(&self) -> i64 {
        hash_key(&self.key)
    }

    /// `len(key) + len(value) + overhead`, where `overhead` depends on
    /// whether the value is encrypted.
    #[must_use]
    pub fn byte_size(&self) -> i64 {
        let overhead = if self.encrypted { ENCRYPTED_OVERHEAD_BYTES } else { BASE_OVERHEAD_BYTES };
        self.key.len() as i64 + self.value.len() as i64 + overhead
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_includes_overhead() {
        let payload = Payload::new(b"k".to_vec(), b"v".to_vec(), false);
        assert_eq!(payload.byte_size(), 1 + 1 + BASE_OVERHEAD_BYTES);
    }

    #[test]
    fn encrypted_payload_charges_larger_overhead() {
        let plain = Payload::new(b"k".to_vec(), b"v".to_vec(), false);
        let encrypted = Payload::new(b"k".to_vec(), b"v".to_vec(), true);
        assert!(encrypted.byte_size() > plain.byte_size());
    }

    #[test]
    fn key_hash_matches_direct_call() {
        let payload = Payload::new(b"alpha".to_vec(), b"v".to_vec(), false);
        assert_eq!(payload.key_hash(), hash_key(b"alpha"));
    }

    #[test]
    fn created_at_round_trips_through_millis() {
        let row = EntryRow {
            id: 1,
            key_hash: 2,
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            byte_size: 3,
            created_at_millis: now_millis(),
        };
        assert_eq!(row.created_at().timestamp_millis(), row.created_at_millis);
    }
}
