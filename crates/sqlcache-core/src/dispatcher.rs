//! Routes each operation to the correct shard's [`Repository`].
//!
//! The dispatcher owns no SQL of its own; it decides *which* repository a
//! call should run against and fans out/collapses results accordingly.
//! The repository itself is oblivious to which [`Strategy`] selected it.

use std::collections::HashMap;
use std::future::Future;

use sqlcache_router::MaglevRouter;

use crate::error::Error;
use crate::repository::Repository;

/// Name of the single shard an [`Strategy::Unmanaged`] dispatcher uses.
pub const UNMANAGED_SHARD: &str = "default";

/// The routing strategy a [`Dispatcher`] was built with. A three-variant
/// sum type, not an inheritance hierarchy: the repository layer doesn't
/// need to know which of these is active.
#[derive(Debug, Clone)]
pub enum Strategy {
    /// A single, unnamed connection. `assign` puts every key under
    /// [`UNMANAGED_SHARD`].
    Unmanaged,
    /// A single named shard; all routing collapses to that name.
    Single(String),
    /// A Maglev router across named shards.
    Sharded(MaglevRouter),
}

/// Routes operations to shards and fans out across them.
#[derive(Clone)]
pub struct Dispatcher {
    strategy: Strategy,
    shards: HashMap<String, Repository>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").field("strategy", &self.strategy).field("shard_count", &self.shards.len()).finish()
    }
}

impl Dispatcher {
    /// Builds an unmanaged dispatcher around a single repository.
    #[must_use]
    pub fn unmanaged(repository: Repository) -> Self {
        let mut shards = HashMap::new();
        shards.insert(UNMANAGED_SHARD.to_string(), repository);
        Self { strategy: Strategy::Unmanaged, shards }
    }

    /// Builds a dispatcher pinned to one named shard.
    #[must_use]
    pub fn single(name: impl Into<String>, repository: Repository) -> Self {
        let name = name.into();
        let mut shards = HashMap::new();
        shards.insert(name.clone(), repository);
        Self { strategy: Strategy::Single(name), shards }
    }

    /// Builds a dispatcher that routes across `shards` via Maglev.
    ///
    /// # Errors
    ///
    /// Propagates [`sqlcache_router::RouterError`] as [`Error::Config`] if
    /// the shard set is invalid (empty, too large, or contains an empty
    /// name).
    pub fn sharded(shards: HashMap<String, Repository>) -> Result<Self, Error> {
        let names: Vec<String> = shards.keys().cloned().collect();
        let router = MaglevRouter::build(&names).map_err(|err| Error::Config(err.to_string()))?;
        Ok(Self { strategy: Strategy::Sharded(router), shards })
    }

    /// The shard name a given key routes to.
    #[must_use]
    pub fn shard_for(&self, key: &[u8]) -> &str {
        match &self.strategy {
            Strategy::Unmanaged => UNMANAGED_SHARD,
            Strategy::Single(name) => name,
            Strategy::Sharded(router) => router.lookup(key),
        }
    }

    /// Groups keys by the shard they route to.
    #[must_use]
    pub fn assign(&self, keys: &[Vec<u8>]) -> HashMap<String, Vec<Vec<u8>>> {
        let mut grouped: HashMap<String, Vec<Vec<u8>>> = HashMap::new();
        for key in keys {
            grouped.entry(self.shard_for(key).to_string()).or_default().push(key.clone());
        }
        grouped
    }

    /// All shard names currently registered, in no particular order.
    #[must_use]
    pub fn shard_names(&self) -> Vec<&str> {
        self.shards.keys().map(String::as_str).collect()
    }

    /// Runs `f` against the repository for `name`.
    pub async fn with<F, Fut, T>(&self, name: &str, f: F) -> Result<T, Error>
    where
        F: FnOnce(&Repository) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let repository = self.shards.get(name).ok_or_else(|| Error::Config(format!("unknown shard: {name}")))?;
        f(repository).await
    }

    /// Runs `f` against the repository the given key routes to.
    pub async fn with_connection_for<F, Fut, T>(&self, key: &[u8], f: F) -> Result<T, Error>
    where
        F: FnOnce(&Repository) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let name = self.shard_for(key).to_string();
        self.with(&name, f).await
    }

    /// Runs `f` against every shard, in registration order, and collects
    /// all results. A failure on one shard does not stop the others from
    /// running.
    pub async fn with_each<F, Fut, T>(&self, mut f: F) -> Vec<Result<T, Error>>
    where
        F: FnMut(&Repository) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut results = Vec::with_capacity(self.shards.len());
        for repository in self.shards.values() {
            results.push(f(repository).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    #[tokio::test]
    async fn unmanaged_routes_everything_to_default() {
        let dispatcher = Dispatcher::unmanaged(memory_repo().await);
        assert_eq!(dispatcher.shard_for(b"anything"), UNMANAGED_SHARD);

        let grouped = dispatcher.assign(&[b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[UNMANAGED_SHARD].len(), 2);
    }

    #[tokio::test]
    async fn single_routes_everything_to_named_shard() {
        let dispatcher = Dispatcher::single("primary", memory_repo().await);
        assert_eq!(dispatcher.shard_for(b"anything"), "primary");
    }

    #[tokio::test]
    async fn sharded_groups_keys_by_router_output() {
        let mut shards = HashMap::new();
        shards.insert("a".to_string(), memory_repo().await);
        shards.insert("b".to_string(), memory_repo().await);
        let dispatcher = Dispatcher::sharded(shards).unwrap();

        let keys: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_be_bytes().to_vec()).collect();
        let grouped = dispatcher.assign(&keys);

        let total: usize = grouped.values().map(Vec::len).sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn with_connection_for_targets_the_right_shard() {
        let mut shards = HashMap::new();
        shards.insert("a".to_string(), memory_repo().await);
        shards.insert("b".to_string(), memory_repo().await);
        let dispatcher = Dispatcher::sharded(shards).unwrap();

        let key = b"some-key".to_vec();
        let shard = dispatcher.shard_for(&key).to_string();

        dispatcher
            .with_connection_for(&key, |repo| async move {
                repo.write_multi(&[crate::entry::Payload::new(key.clone(), vec![1], false)]).await
            })
            .await
            .unwrap();

        let count = dispatcher.with(&shard, |repo| async move { repo.row_count().await }).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn with_each_runs_against_every_shard() {
        let mut shards = HashMap::new();
        shards.insert("a".to_string(), memory_repo().await);
        shards.insert("b".to_string(), memory_repo().await);
        let dispatcher = Dispatcher::sharded(shards).unwrap();

        let results = dispatcher.with_each(|repo| async move { repo.clear().await }).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(Result::is_ok));
    }
}
