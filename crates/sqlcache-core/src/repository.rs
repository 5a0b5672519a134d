//! All SQL against the `entries` table: upsert, multi-read, delete,
//! truncate, locked read-modify-write, id-range, and the size-estimate
//! query helpers.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use rand::Rng;
use sqlx::any::AnyPool;
use sqlx::{QueryBuilder, Row};

use crate::entry::{now_millis, EntryRow, Payload, BASE_OVERHEAD_BYTES};
use crate::error::Error;
use crate::key::hash_key;

/// Upper bound on rows per upsert/read/delete batch, matching the cache
/// framework's historical batching contract.
pub const MAX_BATCH: usize = 1000;

/// SQL dialect a shard's pool speaks. Only the statements that genuinely
/// differ between backends (row locking, table truncation) branch on
/// this; everything else is portable SQL sent through `sqlx::Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// How [`Repository::clear`] empties the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClearWith {
    /// Fast, but unsafe inside a transactional test harness or when other
    /// statements are mid-flight on the same connection.
    Truncate,
    /// Chunked `DELETE`, safe everywhere, slower on large tables.
    Delete,
}

/// A handle to one shard's `entries` table.
#[derive(Clone)]
pub struct Repository {
    pool: AnyPool,
    dialect: Dialect,
    clear_with: ClearWith,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository").field("dialect", &self.dialect).field("clear_with", &self.clear_with).finish()
    }
}

impl Repository {
    #[must_use]
    pub fn new(pool: AnyPool, dialect: Dialect, clear_with: ClearWith) -> Self {
        Self { pool, dialect, clear_with }
    }

    #[must_use]
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Creates the `entries` table if it doesn't exist yet. Host
    /// integrations that manage migrations externally can skip calling
    /// this; it is provided for tests and small deployments.
    pub async fn migrate(&self) -> Result<(), Error> {
        let ddl = match self.dialect {
            Dialect::Sqlite => {
                "CREATE TABLE IF NOT EXISTS entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    key_hash BIGINT NOT NULL UNIQUE,
                    key BLOB NOT NULL,
                    value BLOB NOT NULL,
                    byte_size INTEGER NOT NULL,
                    created_at BIGINT NOT NULL
                )"
            }
            Dialect::Postgres => {
                "CREATE TABLE IF NOT EXISTS entries (
                    id BIGSERIAL PRIMARY KEY,
                    key_hash BIGINT NOT NULL UNIQUE,
                    key BYTEA NOT NULL,
                    value BYTEA NOT NULL,
                    byte_size BIGINT NOT NULL,
                    created_at BIGINT NOT NULL
                )"
            }
        };
        sqlx::query(ddl).execute(&self.pool).await.map_err(Error::from_sqlx)?;
        Ok(())
    }

    /// Upserts up to [`MAX_BATCH`] payloads per call, chunking larger
    /// slices transparently.
    pub async fn write_multi(&self, payloads: &[Payload]) -> Result<(), Error> {
        for chunk in payloads.chunks(MAX_BATCH) {
            self.upsert_batch(chunk).await?;
        }
        Ok(())
    }

    async fn upsert_batch(&self, batch: &[Payload]) -> Result<(), Error> {
        if batch.is_empty() {
            return Ok(());
        }

        let now = now_millis();
        let mut builder: QueryBuilder<sqlx::Any> =
            QueryBuilder::new("INSERT INTO entries (key_hash, key, value, byte_size, created_at) ");

        builder.push_values(batch, |mut row, payload| {
            row.push_bind(payload.key_hash())
                .push_bind(payload.key.clone())
                .push_bind(payload.value.clone())
                .push_bind(payload.byte_size())
                .push_bind(now);
        });

        builder.push(
            " ON CONFLICT (key_hash) DO UPDATE SET \
              key = excluded.key, value = excluded.value, byte_size = excluded.byte_size",
        );

        builder.build().execute(&self.pool).await.map_err(Error::from_sqlx)?;
        Ok(())
    }

    /// Reads up to [`MAX_BATCH`] keys per call. Returns a map from the
    /// *row's own key* to its value, not from the requested key — a
    /// caller whose requested key hashed to the same slot as a different
    /// stored key will simply not find their key in the result, which is
    /// the desired "collision looks like a miss" behavior.
    pub async fn read_multi(&self, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Vec<u8>>, Error> {
        let mut out = HashMap::with_capacity(keys.len());
        for chunk in keys.chunks(MAX_BATCH) {
            self.read_batch(chunk, &mut out).await?;
        }
        Ok(out)
    }

    async fn read_batch(&self, chunk: &[Vec<u8>], out: &mut HashMap<Vec<u8>, Vec<u8>>) -> Result<(), Error> {
        if chunk.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Any> = QueryBuilder::new("SELECT key, value FROM entries WHERE key_hash IN (");
        {
            let mut separated = builder.separated(", ");
            for key in chunk {
                separated.push_bind(hash_key(key));
            }
        }
        builder.push(")");

        let rows = builder.build().fetch_all(&self.pool).await.map_err(Error::from_sqlx)?;
        for row in rows {
            let key: Vec<u8> = row.try_get("key").map_err(Error::from_sqlx)?;
            let value: Vec<u8> = row.try_get("value").map_err(Error::from_sqlx)?;
            out.insert(key, value);
        }
        Ok(())
    }

    /// Deletes rows for the given keys; returns the number of rows
    /// removed.
    pub async fn delete_by_key(&self, keys: &[Vec<u8>]) -> Result<u64, Error> {
        let mut total = 0u64;
        for chunk in keys.chunks(MAX_BATCH) {
            if chunk.is_empty() {
                continue;
            }
            let mut builder: QueryBuilder<sqlx::Any> = QueryBuilder::new("DELETE FROM entries WHERE key_hash IN (");
            {
                let mut separated = builder.separated(", ");
                for key in chunk {
                    separated.push_bind(hash_key(key));
                }
            }
            builder.push(")");
            let result = builder.build().execute(&self.pool).await.map_err(Error::from_sqlx)?;
            total += result.rows_affected();
        }
        Ok(total)
    }

    /// Deletes rows by primary key id, as used by the evictor.
    pub async fn delete_by_id(&self, ids: &[i64]) -> Result<u64, Error> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut builder: QueryBuilder<sqlx::Any> = QueryBuilder::new("DELETE FROM entries WHERE id IN (");
        {
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(*id);
            }
        }
        builder.push(")");
        let result = builder.build().execute(&self.pool).await.map_err(Error::from_sqlx)?;
        Ok(result.rows_affected())
    }

    /// Empties the table using whichever strategy [`ClearWith`] selects.
    pub async fn clear(&self) -> Result<(), Error> {
        match self.clear_with {
            ClearWith::Truncate => {
                // SQLite has no TRUNCATE statement; an unconditional DELETE
                // hits its own "truncate optimization" fast path instead.
                let sql = match self.dialect {
                    Dialect::Postgres => "TRUNCATE TABLE entries",
                    Dialect::Sqlite => "DELETE FROM entries",
                };
                sqlx::query(sql).execute(&self.pool).await.map_err(Error::from_sqlx)?;
                Ok(())
            }
            ClearWith::Delete => {
                const CHUNK: i64 = 1000;
                loop {
                    let affected = sqlx::query("DELETE FROM entries WHERE id IN (SELECT id FROM entries LIMIT ?)")
                        .bind(CHUNK)
                        .execute(&self.pool)
                        .await
                        .map_err(Error::from_sqlx)?
                        .rows_affected();
                    if affected == 0 {
                        break;
                    }
                }
                Ok(())
            }
        }
    }

    /// Row-locked read-modify-write. `f` receives the current value (or
    /// `None` if absent, *or if the stored row's key disagrees with the
    /// requested key* — a key-hash collision is indistinguishable from
    /// absence here, so the call silently overwrites the collided entry).
    /// If `f` returns `Some(new_value)`, the row is upserted inside the
    /// same transaction before it commits.
    pub async fn lock_and_write<F>(&self, key: &[u8], encrypted: bool, f: F) -> Result<Option<Vec<u8>>, Error>
    where
        F: FnOnce(Option<Vec<u8>>) -> Option<Vec<u8>>,
    {
        let key_hash = hash_key(key);
        let mut conn = self.pool.acquire().await.map_err(Error::from_sqlx)?;

        let begin_sql = match self.dialect {
            Dialect::Sqlite => "BEGIN IMMEDIATE",
            Dialect::Postgres => "BEGIN",
        };
        sqlx::query(begin_sql).execute(&mut *conn).await.map_err(Error::from_sqlx)?;

        let select_sql = match self.dialect {
            Dialect::Postgres => "SELECT key, value FROM entries WHERE key_hash = ? FOR UPDATE",
            Dialect::Sqlite => "SELECT key, value FROM entries WHERE key_hash = ?",
        };

        let row = match sqlx::query(select_sql).bind(key_hash).fetch_optional(&mut *conn).await {
            Ok(row) => row,
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(Error::from_sqlx(err));
            }
        };

        let old_value = match row {
            Some(row) => {
                let stored_key: Vec<u8> = match row.try_get("key") {
                    Ok(k) => k,
                    Err(err) => {
                        let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                        return Err(Error::from_sqlx(err));
                    }
                };
                if stored_key == key {
                    match row.try_get::<Vec<u8>, _>("value") {
                        Ok(v) => Some(v),
                        Err(err) => {
                            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                            return Err(Error::from_sqlx(err));
                        }
                    }
                } else {
                    // Hash collision: stored key differs from requested key.
                    // Treated as absent; the write below silently evicts it.
                    None
                }
            }
            None => None,
        };

        let new_value = f(old_value);

        if let Some(ref value) = new_value {
            let now = now_millis();
            let overhead = if encrypted { crate::entry::ENCRYPTED_OVERHEAD_BYTES } else { BASE_OVERHEAD_BYTES };
            let byte_size = key.len() as i64 + value.len() as i64 + overhead;

            let upsert_sql = "INSERT INTO entries (key_hash, key, value, byte_size, created_at) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT (key_hash) DO UPDATE SET \
                 key = excluded.key, value = excluded.value, byte_size = excluded.byte_size";

            let result = sqlx::query(upsert_sql)
                .bind(key_hash)
                .bind(key.to_vec())
                .bind(value.clone())
                .bind(byte_size)
                .bind(now)
                .execute(&mut *conn)
                .await;

            if let Err(err) = result {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(Error::from_sqlx(err));
            }
        }

        sqlx::query("COMMIT").execute(&mut *conn).await.map_err(Error::from_sqlx)?;
        Ok(new_value)
    }

    /// `MAX(id) - MIN(id) + 1` as a cheap, intentionally overestimating
    /// upper bound on row count. Empty table reports 0.
    pub async fn id_range(&self) -> Result<i64, Error> {
        let row = sqlx::query("SELECT MAX(id) AS max_id, MIN(id) AS min_id FROM entries")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::from_sqlx)?;

        let max_id: Option<i64> = row.try_get("max_id").map_err(Error::from_sqlx)?;
        let min_id: Option<i64> = row.try_get("min_id").map_err(Error::from_sqlx)?;

        match (max_id, min_id) {
            (Some(max), Some(min)) => Ok(max - min + 1),
            _ => Ok(0),
        }
    }

    /// Total row count, used by tests to assert exact eviction results.
    /// The evictor itself uses [`Repository::id_range`], not this, since
    /// `COUNT(*)` is the expensive query this engine exists to avoid.
    pub async fn row_count(&self) -> Result<i64, Error> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM entries").fetch_one(&self.pool).await.map_err(Error::from_sqlx)?;
        row.try_get("n").map_err(Error::from_sqlx)
    }

    /// The `n` largest `byte_size` values currently stored. One of the
    /// helpers the size estimator is built from.
    pub async fn largest_byte_sizes(&self, n: i64) -> Result<Vec<i64>, Error> {
        let rows = sqlx::query("SELECT byte_size FROM entries ORDER BY byte_size DESC LIMIT ?")
            .bind(n)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::from_sqlx)?;
        rows.into_iter().map(|row| row.try_get("byte_size").map_err(Error::from_sqlx)).collect()
    }

    /// Rows whose `key_hash` falls within `range`, inclusive. Since
    /// `key_hash` is a SHA-256-derived value, a random sub-range is a
    /// cheap stand-in for a uniform random sample without an `ORDER BY
    /// RANDOM()` full-table scan.
    pub async fn in_key_hash_range(&self, range: RangeInclusive<i64>) -> Result<Vec<EntryRow>, Error> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT id, key_hash, key, value, byte_size, created_at FROM entries WHERE key_hash BETWEEN ? AND ?",
        )
        .bind(*range.start())
        .bind(*range.end())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from_sqlx)?;
        Ok(rows)
    }

    /// Rows with `byte_size <= cutoff`. The other helper the size
    /// estimator is built from; also useful for summing every row
    /// exhaustively on small tables (`cutoff = i64::MAX`).
    pub async fn up_to_byte_size(&self, cutoff: i64) -> Result<Vec<EntryRow>, Error> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT id, key_hash, key, value, byte_size, created_at FROM entries WHERE byte_size <= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from_sqlx)?;
        Ok(rows)
    }

    /// The `limit` rows with the smallest `id`, used by the evictor to
    /// find eviction candidates.
    pub async fn oldest_by_id(&self, limit: i64) -> Result<Vec<EntryRow>, Error> {
        let rows = sqlx::query_as::<_, EntryRow>(
            "SELECT id, key_hash, key, value, byte_size, created_at FROM entries ORDER BY id ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::from_sqlx)?;
        Ok(rows)
    }

    /// Extrapolates total stored bytes from `samples` sampled rows rather
    /// than summing `byte_size` over the whole table. On small tables
    /// (fewer rows than `samples`), sums exhaustively instead.
    pub async fn estimated_size(&self, samples: usize) -> Result<i64, Error> {
        let total_rows = self.id_range().await?;
        if total_rows <= 0 {
            return Ok(0);
        }

        let samples = samples.max(1) as i64;
        if samples >= total_rows {
            let rows = self.up_to_byte_size(i64::MAX).await?;
            return Ok(rows.iter().map(|row| row.byte_size).sum());
        }

        let fraction = samples as f64 / total_rows as f64;
        let span = (u64::MAX as f64 * fraction) as u64;

        let mut rng = rand::thread_rng();
        let start = rng.gen::<u64>();
        let end = start.wrapping_add(span);
        let (lo, hi) = (start as i64, end as i64);
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };

        let sampled = self.in_key_hash_range(lo..=hi).await?;
        if sampled.is_empty() {
            return Ok(0);
        }

        let avg_byte_size = sampled.iter().map(|row| row.byte_size).sum::<i64>() as f64 / sampled.len() as f64;
        Ok((avg_byte_size * total_rows as f64) as i64)
    }
}
