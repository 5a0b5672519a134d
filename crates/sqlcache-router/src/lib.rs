//! Maglev consistent-hash routing for the SQL-backed cache.
//!
//! A [`MaglevRouter`] maps a key to one of a fixed, named set of shards
//! using Google's Maglev hashing algorithm: a precomputed lookup table of
//! prime length is built once from the shard list, and every lookup after
//! that is a single CRC32 plus a table index. Adding or removing a shard
//! only perturbs a small, bounded fraction of the table, so most keys keep
//! their shard across membership changes.
//!
//! This crate only does the routing math: it has no notion of a database
//! connection, a SQL row, or an async runtime. `sqlcache-core` owns those.

use std::fmt;

/// Length of the Maglev lookup table. Must be prime for the permutation
/// construction below to visit every slot exactly once per shard.
pub const TABLE_SIZE: usize = 2053;

/// Errors that can occur while building a [`MaglevRouter`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouterError {
    /// The router was built with no shard names at all.
    #[error("router requires at least one shard")]
    NoShards,

    /// More shards were supplied than the table has slots for. Each shard
    /// needs at least one table slot, so `N` cannot exceed [`TABLE_SIZE`].
    #[error("router supports at most {TABLE_SIZE} shards, got {0}")]
    TooManyShards(usize),

    /// A shard name was the empty string, which would hash the same
    /// regardless of position and is almost certainly a configuration bug.
    #[error("shard names must not be empty")]
    EmptyShardName,
}

/// A single shard's permutation parameters, derived once at build time.
#[derive(Debug, Clone, Copy)]
struct Permutation {
    offset: u64,
    skip: u64,
}

impl Permutation {
    /// The `j`-th slot this shard would prefer, per the Maglev paper.
    #[inline]
    fn slot(&self, j: u64) -> usize {
        ((self.offset + j * self.skip) % TABLE_SIZE as u64) as usize
    }
}

/// Maps keys to shard names via a precomputed Maglev lookup table.
///
/// Construction is deterministic given the same set of shard names
/// regardless of the order they're supplied in: names are sorted before
/// the table is built, so `MaglevRouter::build(&["b", "a"])` and
/// `MaglevRouter::build(&["a", "b"])` produce identical tables.
#[derive(Debug, Clone)]
pub struct MaglevRouter {
    shards: Vec<String>,
    table: Vec<u16>,
}

impl MaglevRouter {
    /// Builds a router from an unordered, possibly-unsorted list of shard
    /// names. Duplicate names are removed before building.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoShards`] if `names` is empty after
    /// deduplication, [`RouterError::TooManyShards`] if there are more
    /// names than [`TABLE_SIZE`], or [`RouterError::EmptyShardName`] if any
    /// name is the empty string.
    pub fn build<S: AsRef<str>>(names: &[S]) -> Result<Self, RouterError> {
        let mut shards: Vec<String> = names.iter().map(|s| s.as_ref().to_string()).collect();
        shards.sort();
        shards.dedup();

        if shards.iter().any(String::is_empty) {
            return Err(RouterError::EmptyShardName);
        }
        if shards.is_empty() {
            return Err(RouterError::NoShards);
        }
        if shards.len() > TABLE_SIZE {
            return Err(RouterError::TooManyShards(shards.len()));
        }

        let permutations: Vec<Permutation> = shards.iter().map(|name| permutation_for(name)).collect();
        let table = build_table(&permutations);

        Ok(MaglevRouter { shards, table })
    }

    /// Returns the shard name a key routes to.
    ///
    /// Deterministic: the same key always returns the same shard for a
    /// given router instance, and the same shard list always builds the
    /// same table (see [`MaglevRouter::build`]).
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> &str {
        let slot = crc32fast::hash(key) as usize % TABLE_SIZE;
        let shard_index = self.table[slot] as usize;
        &self.shards[shard_index]
    }

    /// The deduplicated, sorted shard names this router was built from.
    #[must_use]
    pub fn shard_names(&self) -> &[String] {
        &self.shards
    }

    /// Number of shards this router routes across.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

impl fmt::Display for MaglevRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaglevRouter({} shards)", self.shards.len())
    }
}

/// Derives a shard's `(offset, skip)` pair from two independent 32-bit
/// hashes of its name. MD5 is not used for anything security-sensitive
/// here; it's simply a convenient, widely-available 128-bit digest from
/// which we take two 4-byte windows as `h1`/`h2`. The ":maglev2" suffix
/// on the second digest keeps it independent of the first rather than
/// reusing the same bytes.
fn permutation_for(name: &str) -> Permutation {
    let h1 = u32::from_be_bytes(md5::compute(name.as_bytes())[0..4].try_into().unwrap());
    let salted = format!("{name}:maglev2");
    let h2 = u32::from_be_bytes(md5::compute(salted.as_bytes())[0..4].try_into().unwrap());

    let offset = u64::from(h1) % TABLE_SIZE as u64;
    let skip = u64::from(h2) % (TABLE_SIZE as u64 - 1) + 1;
    Permutation { offset, skip }
}

/// Builds the lookup table by round-robin assignment: on each round every
/// shard claims the next slot in its preference sequence that is still
/// empty. Terminates once every slot is filled, which is guaranteed
/// because each shard's preference sequence is a full permutation of
/// `0..TABLE_SIZE` (`skip` is coprime with the prime `TABLE_SIZE`).
fn build_table(permutations: &[Permutation]) -> Vec<u16> {
    let n = permutations.len();
    let mut next = vec![0u64; n];
    let mut table: Vec<Option<u16>> = vec![None; TABLE_SIZE];
    let mut filled = 0usize;

    'fill: loop {
        for (shard_index, perm) in permutations.iter().enumerate() {
            loop {
                let candidate = perm.slot(next[shard_index]);
                next[shard_index] += 1;
                if table[candidate].is_none() {
                    table[candidate] = Some(shard_index as u16);
                    filled += 1;
                    break;
                }
            }
            if filled == TABLE_SIZE {
                break 'fill;
            }
        }
    }

    table.into_iter().map(|slot| slot.expect("every slot filled by construction")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_shard_list() {
        let names: Vec<&str> = vec![];
        assert_eq!(MaglevRouter::build(&names), Err(RouterError::NoShards));
    }

    #[test]
    fn rejects_too_many_shards() {
        let names: Vec<String> = (0..TABLE_SIZE + 1).map(|i| format!("shard-{i}")).collect();
        assert_eq!(MaglevRouter::build(&names), Err(RouterError::TooManyShards(TABLE_SIZE + 1)));
    }

    #[test]
    fn rejects_empty_shard_name() {
        assert_eq!(MaglevRouter::build(&["a", ""]), Err(RouterError::EmptyShardName));
    }

    #[test]
    fn single_shard_routes_everything_to_itself() {
        let router = MaglevRouter::build(&["only"]).unwrap();
        for key in [b"a".as_slice(), b"xyz".as_slice(), b"".as_slice()] {
            assert_eq!(router.lookup(key), "only");
        }
    }

    #[test]
    fn lookup_is_deterministic() {
        let router = MaglevRouter::build(&["a", "b", "c", "d"]).unwrap();
        let first = router.lookup(b"some-key");
        for _ in 0..100 {
            assert_eq!(router.lookup(b"some-key"), first);
        }
    }

    #[test]
    fn order_independent_construction() {
        let a = MaglevRouter::build(&["d", "b", "a", "c"]).unwrap();
        let b = MaglevRouter::build(&["a", "b", "c", "d"]).unwrap();
        assert_eq!(a.shard_names(), b.shard_names());

        for i in 0u32..5000 {
            let key = i.to_be_bytes();
            assert_eq!(a.lookup(&key), b.lookup(&key));
        }
    }

    #[test]
    fn deduplicates_shard_names() {
        let router = MaglevRouter::build(&["a", "a", "b"]).unwrap();
        assert_eq!(router.shard_count(), 2);
    }

    #[test]
    fn table_partitions_reasonably_evenly() {
        let router = MaglevRouter::build(&["a", "b", "c", "d"]).unwrap();
        let mut counts = [0u32; 4];
        for i in 0u32..100_000 {
            let shard = router.lookup(&i.to_be_bytes());
            let idx = router.shard_names().iter().position(|s| s == shard).unwrap();
            counts[idx] += 1;
        }
        // Perfectly even would be 25_000 each; Maglev guarantees near-even,
        // not exact, distribution.
        for count in counts {
            assert!(count > 20_000 && count < 30_000, "uneven distribution: {counts:?}");
        }
    }

    /// Mirrors spec.md's literal scenario 3: adding one shard to a 4-shard
    /// ring should leave at least 750 of 1000 keys on their original shard.
    #[test]
    fn adding_a_shard_causes_minimal_disruption() {
        let before = MaglevRouter::build(&["a", "b", "c", "d"]).unwrap();
        let after = MaglevRouter::build(&["a", "b", "c", "d", "e"]).unwrap();

        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| format!("key-{i}").into_bytes()).collect();
        let unchanged = keys.iter().filter(|k| before.lookup(k) == after.lookup(k)).count();

        assert!(unchanged >= 750, "only {unchanged}/1000 keys kept their shard");
    }

    #[test]
    fn removing_a_shard_causes_minimal_disruption() {
        let before = MaglevRouter::build(&["a", "b", "c", "d", "e"]).unwrap();
        let after = MaglevRouter::build(&["a", "b", "c", "d"]).unwrap();

        let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| format!("key-{i}").into_bytes()).collect();
        let unchanged = keys
            .iter()
            .filter(|k| before.lookup(k) != "e")
            .filter(|k| before.lookup(k) == after.lookup(k))
            .count();
        let total_not_on_removed = keys.iter().filter(|k| before.lookup(k) != "e").count();

        // Every key that wasn't on the removed shard should be unaffected.
        assert_eq!(unchanged, total_not_on_removed);
    }
}
