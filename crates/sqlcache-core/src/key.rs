//! Key normalization and the 64-bit key hash used as the table's primary index.

use sha2::{Digest, Sha256};

/// Default cap on a normalized key's byte length, matching the cache
/// framework's historical default.
pub const DEFAULT_MAX_KEY_BYTESIZE: usize = 1024;

/// Marker inserted between a truncated key prefix and its collision-safe
/// hash suffix.
const TRUNCATION_MARKER: &str = ":hash:";

/// Derives the signed 64-bit key hash stored in `entries.key_hash`.
///
/// Takes the first 8 bytes of SHA-256(key), interpreted as a big-endian
/// two's-complement integer. The result is bit-cast to `i64`, never taken
/// modulo anything: this is what lets the same value round-trip through
/// database backends that only have a signed 64-bit integer type.
#[must_use]
pub fn hash_key(key: &[u8]) -> i64 {
    let digest = Sha256::digest(key);
    let bytes: [u8; 8] = digest[0..8].try_into().expect("sha256 digest is 32 bytes");
    i64::from_be_bytes(bytes)
}

/// Normalizes a raw key into the bytes that are hashed and stored.
///
/// Applies the optional namespace prefix first (so it participates in
/// both truncation and hashing), then truncates if the result exceeds
/// `max_bytesize`. A truncated key becomes
/// `prefix ‖ ":hash:" ‖ hex(sha256(namespaced_key))`, trimmed so the
/// prefix plus suffix together stay within `max_bytesize`. Two distinct
/// long keys sharing the same truncated prefix get different suffixes
/// with overwhelming probability, so they never collide after
/// normalization.
#[must_use]
pub fn normalize_key(raw: &[u8], namespace: Option<&str>, max_bytesize: usize) -> Vec<u8> {
    let namespaced: Vec<u8> = match namespace {
        Some(ns) if !ns.is_empty() => {
            let mut buf = Vec::with_capacity(ns.len() + 1 + raw.len());
            buf.extend_from_slice(ns.as_bytes());
            buf.push(b':');
            buf.extend_from_slice(raw);
            buf
        }
        _ => raw.to_vec(),
    };

    if namespaced.len() <= max_bytesize {
        return namespaced;
    }

    let digest = Sha256::digest(&namespaced);
    let suffix = format!("{TRUNCATION_MARKER}{digest:x}");
    let suffix_len = suffix.len();

    let prefix_len = max_bytesize.saturating_sub(suffix_len);
    let mut truncated = Vec::with_capacity(max_bytesize);
    truncated.extend_from_slice(&namespaced[..prefix_len.min(namespaced.len())]);
    truncated.extend_from_slice(suffix.as_bytes());
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_key_passes_through_unchanged() {
        let key = b"hello";
        assert_eq!(normalize_key(key, None, 1024), key.to_vec());
    }

    #[test]
    fn namespace_prefixes_before_truncation_check() {
        let key = b"hello";
        assert_eq!(normalize_key(key, Some("ns"), 1024), b"ns:hello".to_vec());
    }

    #[test]
    fn long_key_is_truncated_with_hash_suffix() {
        let key = vec![b'A'; 2000];
        let normalized = normalize_key(&key, None, 1024);
        assert_eq!(normalized.len(), 1024);
        assert!(normalized.ends_with(format!("{TRUNCATION_MARKER}").as_bytes())
            || normalized.windows(TRUNCATION_MARKER.len()).any(|w| w == TRUNCATION_MARKER.as_bytes()));
    }

    #[test]
    fn distinct_long_keys_stay_distinct_after_truncation() {
        let a: Vec<u8> = std::iter::repeat(b'A').take(100).collect();
        let mut b: Vec<u8> = std::iter::repeat(b'A').take(99).collect();
        b.push(b'B');

        let normalized_a = normalize_key(&a, None, 32);
        let normalized_b = normalize_key(&b, None, 32);

        assert_ne!(normalized_a, normalized_b);
        assert_eq!(normalized_a.len(), 32);
        assert_eq!(normalized_b.len(), 32);
    }

    #[test]
    fn hash_key_is_deterministic() {
        assert_eq!(hash_key(b"alpha"), hash_key(b"alpha"));
    }

    #[test]
    fn hash_key_fits_signed_64_bit_by_construction() {
        // i64 is inherently bounded; this documents the invariant rather
        // than testing arithmetic, since `hash_key` returns i64 directly.
        let h = hash_key(b"any key");
        assert!(h >= i64::MIN && h <= i64::MAX);
    }

    #[test]
    fn hash_key_differs_for_different_keys_in_practice() {
        assert_ne!(hash_key(b"alpha"), hash_key(b"beta"));
    }
}
