//! Typed KV Store Gateway: `get`/`set`/`delete`/`mget`/`scan` over a shared
//! persistent key-value store, presented as a capability trait so the story
//! engine and its callers never talk to a concrete backend directly.
//!
//! Grounded on `resources/redis.py` for the operation set — a thin
//! wrapper over a single-instance client — with an async-trait-over-sqlx
//! implementation shape for the persistent backend.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoryResult;

pub use memory::MemoryKvStore;
pub use sqlite::SqliteKvStore;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoryResult<Option<Bytes>>;
    async fn set(&self, key: &str, value: Bytes) -> StoryResult<()>;
    async fn delete(&self, key: &str) -> StoryResult<()>;

    async fn mget(&self, keys: &[String]) -> StoryResult<Vec<Option<Bytes>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Returns every key with the given prefix. The source's `scan` is
    /// cursor-based; since every backend here fits in a single round trip we
    /// collapse it to one call returning the full matching key set.
    async fn scan(&self, prefix: &str) -> StoryResult<Vec<String>>;
}

#[cfg(test)]
mod contract_tests {
    use super::*;

    async fn exercise(store: &dyn KvStore) {
        assert!(store.get("missing").await.unwrap().is_none());

        store.set("plr:+15105551234", Bytes::from_static(b"{}")).await.unwrap();
        assert_eq!(
            store.get("plr:+15105551234").await.unwrap().unwrap(),
            Bytes::from_static(b"{}")
        );

        store.set("plr:+15105559999", Bytes::from_static(b"{}")).await.unwrap();
        let mut scanned = store.scan("plr:").await.unwrap();
        scanned.sort();
        assert_eq!(scanned, vec!["plr:+15105551234".to_string(), "plr:+15105559999".to_string()]);

        store.delete("plr:+15105551234").await.unwrap();
        assert!(store.get("plr:+15105551234").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_satisfies_contract() {
        exercise(&MemoryKvStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_satisfies_contract() {
        let store = SqliteKvStore::new_in_memory().await.unwrap();
        exercise(&store).await;
    }
}
