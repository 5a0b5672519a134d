//! Background expiry: probabilistic write-triggered eviction scheduling,
//! and the per-batch candidate-selection algorithm it drives.
//!
//! This module only computes *how many* batches to schedule and *what one
//! batch does* against a given repository. Capturing which shard a batch
//! targets and handing it to the execution layer is the caller's job
//! (explicit parameter, not ambient state — see the crate's design notes
//! on why this replaced a thread-local "current shard").

use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::entry::now_millis;
use crate::error::Error;
use crate::repository::Repository;

/// Default maximum entry age: two weeks.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(14 * 24 * 60 * 60);

/// Default eviction batch size.
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Default ratio of eviction rate to write rate.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default sample count for the size estimator.
pub const DEFAULT_SIZE_ESTIMATE_SAMPLES: usize = 10_000;

/// Where eviction tasks are scheduled to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Method {
    /// Submitted to the in-process execution layer (`sqlcache-core`'s
    /// [`crate::executor::Executor`]).
    Thread,
    /// Enqueued as a durable job on a host-supplied queue.
    Job,
}

impl Default for Method {
    fn default() -> Self {
        Method::Thread
    }
}

/// The bounds eviction enforces. At least one must be set for eviction to
/// do anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds {
    pub max_age: Option<Duration>,
    pub max_entries: Option<i64>,
    pub max_size: Option<i64>,
}

impl Bounds {
    #[must_use]
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    #[must_use]
    pub fn with_max_entries(mut self, max_entries: i64) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    #[must_use]
    pub fn with_max_size(mut self, max_size: i64) -> Self {
        self.max_size = Some(max_size);
        self
    }
}

/// Computes batch counts and runs individual eviction batches.
#[derive(Debug, Clone)]
pub struct ExpiryController {
    bounds: Bounds,
    batch_size: i64,
    multiplier: f64,
    size_estimate_samples: usize,
    method: Method,
}

impl Default for ExpiryController {
    fn default() -> Self {
        Self {
            bounds: Bounds::default().with_max_age(DEFAULT_MAX_AGE),
            batch_size: DEFAULT_BATCH_SIZE,
            multiplier: DEFAULT_MULTIPLIER,
            size_estimate_samples: DEFAULT_SIZE_ESTIMATE_SAMPLES,
            method: Method::Thread,
        }
    }
}

impl ExpiryController {
    #[must_use]
    pub fn new(bounds: Bounds, batch_size: i64, multiplier: f64, size_estimate_samples: usize, method: Method) -> Self {
        Self { bounds, batch_size, multiplier, size_estimate_samples, method }
    }

    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    #[must_use]
    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// After a write of `count` rows, how many eviction batches should be
    /// scheduled.
    ///
    /// `expected = count / batch_size * multiplier` is generally
    /// fractional; the whole part is always scheduled, and the fractional
    /// part is resolved by an independent Bernoulli draw rather than
    /// rounding, so the long-run eviction rate averages exactly
    /// `multiplier × write_rate` instead of being biased up or down by
    /// whichever way rounding happened to fall.
    #[must_use]
    pub fn batches_for_write(&self, count: u64) -> u64 {
        self.batches_for_write_with_rng(count, &mut rand::thread_rng())
    }

    fn batches_for_write_with_rng(&self, count: u64, rng: &mut impl Rng) -> u64 {
        let expected = count as f64 * (1.0 / self.batch_size as f64) * self.multiplier;
        let whole = expected.floor();
        let fractional = expected - whole;
        let extra = u64::from(rng.gen::<f64>() < fractional);
        whole as u64 + extra
    }

    /// Runs one eviction batch against `repository`.
    ///
    /// 1. Determine whether the cache is over its entry-count or byte-size
    ///    bound ("cache-full").
    /// 2. If not full and no `max_age` is configured, there is nothing to
    ///    do.
    /// 3. Over-fetch `3 × batch_size` of the oldest rows by `id` — the 3×
    ///    margin means concurrent evictors sampling from the same
    ///    candidate pool rarely pick the same rows to delete.
    /// 4. If full, every over-fetched row is a candidate; otherwise keep
    ///    only rows older than `max_age`.
    /// 5. Uniformly sample `batch_size` candidates and delete them.
    ///
    /// Returns the number of rows actually deleted (may be less than
    /// `batch_size` if there weren't enough candidates).
    pub async fn evict(&self, repository: &Repository) -> Result<u64, Error> {
        let cache_full = self.is_cache_full(repository).await?;
        if !cache_full && self.bounds.max_age.is_none() {
            return Ok(0);
        }

        let over_fetch = self.batch_size.saturating_mul(3);
        let rows = repository.oldest_by_id(over_fetch).await?;

        let candidates: Vec<i64> = if cache_full {
            rows.iter().map(|row| row.id).collect()
        } else {
            let max_age = self.bounds.max_age.expect("checked above");
            let max_age_millis = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
            let cutoff_millis = now_millis().saturating_sub(max_age_millis);
            rows.iter().filter(|row| row.created_at_millis < cutoff_millis).map(|row| row.id).collect()
        };

        if candidates.is_empty() {
            return Ok(0);
        }

        let sample = sample_uniform(&candidates, self.batch_size.max(0) as usize);
        repository.delete_by_id(&sample).await
    }

    async fn is_cache_full(&self, repository: &Repository) -> Result<bool, Error> {
        if let Some(max_entries) = self.bounds.max_entries {
            if max_entries < repository.id_range().await? {
                return Ok(true);
            }
        }
        if let Some(max_size) = self.bounds.max_size {
            if max_size < repository.estimated_size(self.size_estimate_samples).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn sample_uniform(candidates: &[i64], n: usize) -> Vec<i64> {
    let mut rng = rand::thread_rng();
    let mut shuffled = candidates.to_vec();
    shuffled.shuffle(&mut rng);
    shuffled.truncate(n);
    shuffled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Payload;
    use crate::repository::{ClearWith, Dialect};

    async fn memory_repo() -> Repository {
        sqlx::any::install_default_drivers();
        // Capped at one connection so the whole test sees a single shared
        // in-memory database rather than one per pooled connection.
        let pool = sqlx::any::AnyPoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        let repo = Repository::new(pool, Dialect::Sqlite, ClearWith::Delete);
        repo.migrate().await.unwrap();
        repo
    }

    #[test]
    fn batches_for_write_mean_matches_expected_rate() {
        let controller = ExpiryController::new(Bounds::default(), 100, 2.0, 10_000, Method::Thread);
        let mut rng = rand::rngs::mock::StepRng::new(0, 1 << 20);

        let mut total = 0u64;
        const WRITES: u64 = 10_000;
        for _ in 0..WRITES {
            total += controller.batches_for_write_with_rng(1, &mut rng);
        }

        // expected = 1 * (1/100) * 2 = 0.02 batches per write on average.
        let expected_total = WRITES as f64 * 0.02;
        let ratio = total as f64 / expected_total;
        assert!(ratio > 0.5 && ratio < 1.5, "observed {total}, expected ~{expected_total}");
    }

    #[test]
    fn batches_for_write_is_never_negative_or_absurd() {
        let controller = ExpiryController::new(Bounds::default(), 100, 2.0, 10_000, Method::Thread);
        for count in [0u64, 1, 50, 100, 10_000] {
            let batches = controller.batches_for_write(count);
            assert!(batches <= count.max(1) * 3, "batches {batches} implausible for count {count}");
        }
    }

    #[tokio::test]
    async fn evict_does_nothing_when_not_full_and_no_max_age() {
        let repo = memory_repo().await;
        repo.write_multi(&[Payload::new(b"a".to_vec(), vec![0], false)]).await.unwrap();

        let controller = ExpiryController::new(Bounds::default(), 100, 2.0, 10_000, Method::Thread);
        let deleted = controller.evict(&repo).await.unwrap();
        assert_eq!(deleted, 0);
    }

    #[tokio::test]
    async fn evict_removes_rows_when_cache_full() {
        let repo = memory_repo().await;
        for i in 0..20 {
            repo.write_multi(&[Payload::new(format!("k{i}").into_bytes(), vec![0], false)]).await.unwrap();
        }

        let bounds = Bounds::default().with_max_entries(5);
        let controller = ExpiryController::new(bounds, 10, 2.0, 10_000, Method::Thread);
        let deleted = controller.evict(&repo).await.unwrap();
        assert!(deleted > 0);
        assert!(repo.row_count().await.unwrap() < 20);
    }

    #[tokio::test]
    async fn evict_removes_rows_older_than_max_age() {
        let repo = memory_repo().await;
        for i in 0..10 {
            repo.write_multi(&[Payload::new(format!("k{i}").into_bytes(), vec![0], false)]).await.unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let bounds = Bounds::default().with_max_age(std::time::Duration::from_millis(10));
        let controller = ExpiryController::new(bounds, 100, 2.0, 10_000, Method::Thread);
        let deleted = controller.evict(&repo).await.unwrap();
        assert_eq!(deleted, 10);
        assert_eq!(repo.row_count().await.unwrap(), 0);
    }
}
