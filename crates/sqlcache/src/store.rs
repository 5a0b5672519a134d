//! The cache API surface: get/set/fetch/delete/incr/decr/multi/clear,
//! key normalization, and the entry (de)serialization hooks that tie
//! into the host cache framework.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sqlcache_core::{
    Dispatcher, Error, ExpiryController, ExpiryMethod, Executor, Failsafe, NoopRuntime, Payload, RuntimeWrapper,
};

use crate::config::Config;
use crate::framework::{CacheEntry, EncryptionWrapper, EntrySerializer, NoopStatsSink, RawBytesSerializer, StatsSink};

/// The assembled cache: router/repository/dispatcher/failsafe/expiry/pool
/// held as capabilities on one structure rather than mixed in through an
/// inheritance chain. A decorator (e.g. an in-process "near" cache) wraps
/// this from the outside; it is not part of the struct itself.
pub struct Store<R = NoopRuntime>
where
    R: RuntimeWrapper,
{
    config: Config,
    dispatcher: Arc<Dispatcher>,
    failsafe: Failsafe,
    expiry: ExpiryController,
    executor: Arc<Executor<R>>,
    serializer: Arc<dyn EntrySerializer>,
    encryption: Option<Arc<dyn EncryptionWrapper>>,
    stats: Arc<dyn StatsSink>,
}

impl<R> std::fmt::Debug for Store<R>
where
    R: RuntimeWrapper,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Store<NoopRuntime> {
    /// Builds a store with the default (no-op) host-runtime wrapper, a
    /// raw-bytes entry serializer, and no stats sink or encryption.
    /// Suited for tests and for hosts with no framework collaborators to
    /// plug in yet.
    #[must_use]
    pub fn new(config: Config, dispatcher: Dispatcher, failsafe: Failsafe) -> Self {
        let executor = Executor::spawn(NoopRuntime, failsafe.clone());
        Self::with_collaborators(config, dispatcher, failsafe, executor, Arc::new(RawBytesSerializer), Arc::new(NoopStatsSink), None)
    }
}

impl<R> Store<R>
where
    R: RuntimeWrapper,
{
    /// Builds a store with every collaborator supplied explicitly.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn with_collaborators(
        config: Config,
        dispatcher: Dispatcher,
        failsafe: Failsafe,
        executor: Executor<R>,
        serializer: Arc<dyn EntrySerializer>,
        stats: Arc<dyn StatsSink>,
        encryption: Option<Arc<dyn EncryptionWrapper>>,
    ) -> Self {
        let expiry = ExpiryController::new(
            sqlcache_core::ExpiryBounds {
                max_age: config.max_age,
                max_entries: config.max_entries,
                max_size: config.max_size,
            },
            config.expiry_batch_size,
            config.expiry_multiplier,
            config.size_estimate_samples,
            config.expiry_method,
        );

        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            failsafe,
            expiry,
            executor: Arc::new(executor),
            serializer,
            encryption,
            stats,
        }
    }

    fn normalize_key(&self, key: &[u8]) -> Vec<u8> {
        sqlcache_core::normalize_key(key, self.config.namespace.as_deref(), self.config.max_key_bytesize)
    }

    /// Decrypts (if configured) and deserializes stored bytes into a
    /// [`CacheEntry`]. Returns `None` on any decryption or deserialization
    /// failure: a corrupt or undecryptable entry looks exactly like a
    /// cache miss to the caller.
    fn decode_entry(&self, raw: &[u8]) -> Option<CacheEntry> {
        let plaintext = match &self.encryption {
            Some(enc) => enc.decrypt(raw).ok()?,
            None => raw.to_vec(),
        };
        self.serializer.deserialize(&plaintext)
    }

    fn encode_entry(&self, entry: &CacheEntry) -> Result<Vec<u8>, Error> {
        let bytes = self.serializer.serialize(entry).map_err(Error::Config)?;
        match &self.encryption {
            Some(enc) => enc.encrypt(&bytes).map_err(Error::Config),
            None => Ok(bytes),
        }
    }

    /// Reads one key. Expired entries are deleted as a side effect;
    /// version-mismatched and undeserializable entries are dropped
    /// silently, both surfacing as `Ok(None)`.
    pub async fn read(&self, key: &[u8], expected_version: Option<&str>) -> Result<Option<Vec<u8>>, Error> {
        let normalized = self.normalize_key(key);
        let map = self.read_raw(std::slice::from_ref(&normalized)).await?;

        let Some(raw) = map.get(&normalized) else {
            self.stats.record_miss();
            return Ok(None);
        };

        let Some(entry) = self.decode_entry(raw) else {
            self.stats.record_miss();
            return Ok(None);
        };

        if entry.is_expired() {
            self.delete(key).await?;
            self.stats.record_miss();
            return Ok(None);
        }

        if entry.is_mismatched(expected_version) {
            self.stats.record_miss();
            return Ok(None);
        }

        self.stats.record_hit();
        Ok(Some(entry.value))
    }

    /// Reads many keys at once. Missing, expired, mismatched, or corrupt
    /// entries are simply absent from the result map rather than erroring.
    pub async fn read_multi(
        &self,
        keys: &[Vec<u8>],
        expected_version: Option<&str>,
    ) -> Result<HashMap<Vec<u8>, Vec<u8>>, Error> {
        let normalized: Vec<Vec<u8>> = keys.iter().map(|k| self.normalize_key(k)).collect();
        let raw_map = self.read_raw(&normalized).await?;

        let mut out = HashMap::with_capacity(raw_map.len());
        let mut expired_keys = Vec::new();

        for (normalized_key, raw) in &raw_map {
            let Some(entry) = self.decode_entry(raw) else { continue };
            if entry.is_expired() {
                expired_keys.push(normalized_key.clone());
                continue;
            }
            if entry.is_mismatched(expected_version) {
                continue;
            }
            out.insert(normalized_key.clone(), entry.value);
        }

        if !expired_keys.is_empty() {
            self.delete_normalized(&expired_keys).await?;
        }

        if out.is_empty() {
            self.stats.record_miss();
        } else {
            self.stats.record_hit();
        }
        Ok(out)
    }

    async fn read_raw(&self, normalized_keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, Vec<u8>>, Error> {
        let dispatcher = self.dispatcher.clone();
        let grouped = dispatcher.assign(normalized_keys);

        let mut out = HashMap::new();
        for (shard, keys) in grouped {
            let shard_result = self
                .failsafe
                .guard("read_entry", HashMap::new(), || {
                    let dispatcher = dispatcher.clone();
                    let shard = shard.clone();
                    let keys = keys.clone();
                    async move { dispatcher.with(&shard, |repo| { let keys = keys.clone(); async move { repo.read_multi(&keys).await } }).await }
                })
                .await?;
            out.extend(shard_result);
        }
        Ok(out)
    }

    /// Writes one key with an optional time-to-live.
    pub async fn write(&self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) -> Result<(), Error> {
        let entry = CacheEntry { value, expires_at: ttl.map(|d| SystemTime::now() + d), version: None };
        self.write_entry(key, &entry).await
    }

    /// Writes only if the key is absent or its stored entry has expired.
    /// Returns `true` if the write happened.
    pub async fn write_unless_exist(&self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) -> Result<bool, Error> {
        let normalized = self.normalize_key(key);
        let new_entry = CacheEntry { value, expires_at: ttl.map(|d| SystemTime::now() + d), version: None };
        let new_bytes = self.encode_entry(&new_entry)?;

        let dispatcher = self.dispatcher.clone();
        let encrypted = self.config.encrypt;
        let serializer = self.serializer.clone();
        let encryption = self.encryption.clone();

        let written = self
            .failsafe
            .guard("write_entry", false, {
                let normalized = normalized.clone();
                let new_bytes = new_bytes.clone();
                move || {
                    let dispatcher = dispatcher.clone();
                    let normalized = normalized.clone();
                    let new_bytes = new_bytes.clone();
                    let serializer = serializer.clone();
                    let encryption = encryption.clone();
                    async move {
                        dispatcher
                            .with_connection_for(&normalized, |repo| async move {
                                let mut wrote = false;
                                repo.lock_and_write(&normalized, encrypted, |old| {
                                    let stored_entry = old.and_then(|raw| {
                                        let plaintext = match &encryption {
                                            Some(enc) => enc.decrypt(&raw).ok()?,
                                            None => raw,
                                        };
                                        serializer.deserialize(&plaintext)
                                    });
                                    let absent_or_expired = stored_entry.map_or(true, |entry| entry.is_expired());
                                    if absent_or_expired {
                                        wrote = true;
                                        Some(new_bytes.clone())
                                    } else {
                                        None
                                    }
                                })
                                .await?;
                                Ok(wrote)
                            })
                            .await
                    }
                }
            })
            .await?;

        if written {
            self.stats.record_write(1);
            self.schedule_expiry_after_write(&normalized, 1).await;
        }
        Ok(written)
    }

    async fn write_entry(&self, key: &[u8], entry: &CacheEntry) -> Result<(), Error> {
        let normalized = self.normalize_key(key);
        let bytes = self.encode_entry(entry)?;
        let payload = Payload::new(normalized.clone(), bytes, self.config.encrypt);
        self.write_payloads(vec![payload]).await?;
        self.stats.record_write(1);
        self.schedule_expiry_after_write(&normalized, 1).await;
        Ok(())
    }

    /// Writes many key/value pairs, coalesced into one upsert per shard
    /// (payloads are grouped by `Dispatcher::assign` before issuing SQL,
    /// not one round trip per key).
    pub async fn write_multi(&self, pairs: &[(Vec<u8>, Vec<u8>)], ttl: Option<Duration>) -> Result<(), Error> {
        let expires_at = ttl.map(|d| SystemTime::now() + d);
        let mut payloads = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let normalized = self.normalize_key(key);
            let entry = CacheEntry { value: value.clone(), expires_at, version: None };
            let bytes = self.encode_entry(&entry)?;
            payloads.push(Payload::new(normalized, bytes, self.config.encrypt));
        }
        let count = payloads.len() as u64;
        self.write_payloads(payloads.clone()).await?;
        self.stats.record_write(count);

        for payload in &payloads {
            self.schedule_expiry_after_write(&payload.key, 1).await;
        }
        Ok(())
    }

    async fn write_payloads(&self, payloads: Vec<Payload>) -> Result<(), Error> {
        let dispatcher = self.dispatcher.clone();
        let mut grouped: HashMap<String, Vec<Payload>> = HashMap::new();
        for payload in payloads {
            let shard = dispatcher.shard_for(&payload.key).to_string();
            grouped.entry(shard).or_default().push(payload);
        }

        for (shard, batch) in grouped {
            self.failsafe
                .guard("write_entry", (), {
                    let dispatcher = dispatcher.clone();
                    let shard = shard.clone();
                    let batch = batch.clone();
                    move || {
                        let dispatcher = dispatcher.clone();
                        let shard = shard.clone();
                        let batch = batch.clone();
                        async move { dispatcher.with(&shard, |repo| { let batch = batch.clone(); async move { repo.write_multi(&batch).await } }).await }
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Atomically adds `amount` to the integer stored at `key`,
    /// preserving its expiry if one was set. Returns the new value.
    pub async fn increment(&self, key: &[u8], amount: i64) -> Result<i64, Error> {
        let normalized = self.normalize_key(key);
        let dispatcher = self.dispatcher.clone();
        let encrypted = self.config.encrypt;
        let serializer = self.serializer.clone();
        let encryption = self.encryption.clone();

        let new_bytes = self
            .failsafe
            .guard("increment", None, {
                let normalized = normalized.clone();
                move || {
                    let dispatcher = dispatcher.clone();
                    let normalized = normalized.clone();
                    let serializer = serializer.clone();
                    let encryption = encryption.clone();
                    async move {
                        dispatcher
                            .with_connection_for(&normalized, |repo| async move {
                                repo.lock_and_write(&normalized, encrypted, move |old| {
                                    let old_plain = old.and_then(|raw| match &encryption {
                                        Some(enc) => enc.decrypt(&raw).ok(),
                                        None => Some(raw),
                                    });
                                    let old_entry = old_plain.as_deref().and_then(|raw| serializer.deserialize(raw));

                                    let current = old_entry
                                        .as_ref()
                                        .and_then(|e| parse_i64(&e.value))
                                        .or_else(|| old_plain.as_deref().and_then(parse_i64))
                                        .unwrap_or(0);

                                    let mut new_entry = CacheEntry::new((current + amount).to_string().into_bytes());
                                    if let Some(old_entry) = &old_entry {
                                        new_entry.expires_at = old_entry.expires_at;
                                        new_entry.version = old_entry.version.clone();
                                    }

                                    let serialized = serializer.serialize(&new_entry).ok()?;
                                    match &encryption {
                                        Some(enc) => enc.encrypt(&serialized).ok(),
                                        None => Some(serialized),
                                    }
                                })
                                .await
                            })
                            .await
                    }
                }
            })
            .await?;

        let stored = new_bytes.ok_or_else(|| Error::Config("lock_and_write returned no value".to_string()))?;
        let entry = self.decode_entry(&stored).ok_or_else(|| Error::Config("corrupt counter entry".to_string()))?;
        let value = parse_i64(&entry.value).ok_or_else(|| Error::Config("counter value is not an integer".to_string()))?;

        self.stats.record_write(1);
        self.schedule_expiry_after_write(&normalized, 1).await;
        Ok(value)
    }

    /// `increment(key, -amount)`.
    pub async fn decrement(&self, key: &[u8], amount: i64) -> Result<i64, Error> {
        self.increment(key, -amount).await
    }

    /// Deletes one key. Returns whether a row was actually removed.
    pub async fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        let normalized = self.normalize_key(key);
        let deleted = self.delete_normalized(std::slice::from_ref(&normalized)).await?;
        Ok(deleted > 0)
    }

    /// Deletes many keys; returns the number of rows removed.
    pub async fn delete_multi(&self, keys: &[Vec<u8>]) -> Result<u64, Error> {
        let normalized: Vec<Vec<u8>> = keys.iter().map(|k| self.normalize_key(k)).collect();
        self.delete_normalized(&normalized).await
    }

    async fn delete_normalized(&self, normalized_keys: &[Vec<u8>]) -> Result<u64, Error> {
        let dispatcher = self.dispatcher.clone();
        let grouped = dispatcher.assign(normalized_keys);

        let mut total = 0u64;
        for (shard, keys) in grouped {
            let deleted = self
                .failsafe
                .guard("delete_entry", 0u64, {
                    let dispatcher = dispatcher.clone();
                    let shard = shard.clone();
                    let keys = keys.clone();
                    move || {
                        let dispatcher = dispatcher.clone();
                        let shard = shard.clone();
                        let keys = keys.clone();
                        async move { dispatcher.with(&shard, |repo| { let keys = keys.clone(); async move { repo.delete_by_key(&keys).await } }).await }
                    }
                })
                .await?;
            total += deleted;
        }
        Ok(total)
    }

    /// Cheap existence check: reads through the same path as `read` but
    /// discards the value.
    pub async fn exists(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.read(key, None).await?.is_some())
    }

    /// Reads `key`; on a miss, calls `compute`, writes the result with
    /// `ttl`, and returns it.
    pub async fn fetch<F, Fut>(&self, key: &[u8], ttl: Option<Duration>, compute: F) -> Result<Vec<u8>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Vec<u8>>,
    {
        if let Some(value) = self.read(key, None).await? {
            return Ok(value);
        }
        let value = compute().await;
        self.write(key, value.clone(), ttl).await?;
        Ok(value)
    }

    /// Empties every shard.
    pub async fn clear(&self) -> Result<(), Error> {
        let results = self.dispatcher.with_each(|repo| repo.clear()).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Unsupported: requires a key-pattern index this schema doesn't
    /// carry. Raises immediately, matching the source system.
    pub fn delete_matched(&self, _pattern: &str) -> Result<(), Error> {
        Err(Error::Unsupported("delete_matched"))
    }

    /// Unsupported: there is no generic sweep operation separate from the
    /// expiry controller's targeted eviction. Raises immediately.
    pub fn cleanup(&self) -> Result<(), Error> {
        Err(Error::Unsupported("cleanup"))
    }

    async fn schedule_expiry_after_write(&self, normalized_key: &[u8], count: u64) {
        if self.expiry.method() != ExpiryMethod::Thread {
            tracing::debug!("expiry method is not thread-based; job-queue scheduling requires a host collaborator");
            return;
        }

        let batches = self.expiry.batches_for_write(count);
        if batches == 0 {
            return;
        }

        let shard = self.dispatcher.shard_for(normalized_key).to_string();
        for _ in 0..batches {
            let dispatcher = self.dispatcher.clone();
            let expiry = self.expiry.clone();
            let failsafe = self.failsafe.clone();
            let shard = shard.clone();

            let accepted = self.executor.submit(Box::new(move || {
                Box::pin(async move {
                    let _ = failsafe
                        .guard(sqlcache_core::executor::ASYNC_TAG, 0u64, move || {
                            let dispatcher = dispatcher.clone();
                            let expiry = expiry.clone();
                            let shard = shard.clone();
                            async move { dispatcher.with(&shard, |repo| { let expiry = expiry.clone(); async move { expiry.evict(repo).await } }).await }
                        })
                        .await;
                })
            }));

            if !accepted {
                tracing::debug!("eviction task discarded: background queue full");
            }
        }
    }
}

fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ShardTopology};
    use sqlcache_core::{ClearWith, Dialect, Repository};

    async fn test_store() -> Store {
        sqlx::any::install_default_drivers();
        // Capped at one connection so the 50-way concurrent increment
        // test actually serializes through this store's row lock instead
        // of each pooled connection seeing its own independent database.
        let pool = sqlx::any::AnyPoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        let repository = Repository::new(pool, Dialect::Sqlite, ClearWith::Delete);
        repository.migrate().await.unwrap();

        let dispatcher = Dispatcher::unmanaged(repository);
        let config = Config { topology: ShardTopology::Unmanaged, max_age: None, ..Config::default() };
        Store::new(config, dispatcher, Failsafe::noop())
    }

    #[tokio::test]
    async fn round_trip_scenario() {
        let store = test_store().await;
        store.write(b"alpha", vec![1, 2, 3], None).await.unwrap();
        assert_eq!(store.read(b"alpha", None).await.unwrap(), Some(vec![1, 2, 3]));

        store.delete(b"alpha").await.unwrap();
        assert_eq!(store.read(b"alpha", None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn collision_safe_truncation_scenario() {
        let store = test_store().await;
        let a = vec![b'A'; 100];
        let mut b = vec![b'A'; 99];
        b.push(b'B');

        store.write(&a, b"value-a".to_vec(), None).await.unwrap();
        store.write(&b, b"value-b".to_vec(), None).await.unwrap();

        assert_eq!(store.read(&a, None).await.unwrap(), Some(b"value-a".to_vec()));
        assert_eq!(store.read(&b, None).await.unwrap(), Some(b"value-b".to_vec()));
    }

    #[tokio::test]
    async fn increment_scenario() {
        let store = test_store().await;
        store.write(b"n", b"5".to_vec(), None).await.unwrap();

        let mut handles = Vec::new();
        let store = Arc::new(store);
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.increment(b"n", 1).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.read(b"n", None).await.unwrap(), Some(b"55".to_vec()));
    }

    #[tokio::test]
    async fn cleanup_is_unsupported() {
        let store = test_store().await;
        assert!(store.cleanup().is_err());
        assert!(store.delete_matched("*").is_err());
    }

    #[tokio::test]
    async fn exists_reflects_presence() {
        let store = test_store().await;
        assert!(!store.exists(b"missing").await.unwrap());
        store.write(b"present", vec![1], None).await.unwrap();
        assert!(store.exists(b"present").await.unwrap());
    }

    #[tokio::test]
    async fn fetch_computes_on_miss_and_caches() {
        let store = test_store().await;
        let value = store.fetch(b"computed", None, || async { b"expensive".to_vec() }).await.unwrap();
        assert_eq!(value, b"expensive");

        let value_again = store.fetch(b"computed", None, || async { b"should-not-run".to_vec() }).await.unwrap();
        assert_eq!(value_again, b"expensive");
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let store = test_store().await;
        store.write(b"a", vec![1], None).await.unwrap();
        store.write(b"b", vec![2], None).await.unwrap();

        store.clear().await.unwrap();

        assert_eq!(store.read(b"a", None).await.unwrap(), None);
        assert_eq!(store.read(b"b", None).await.unwrap(), None);
    }
}
