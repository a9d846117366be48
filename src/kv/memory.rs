//! In-memory [`KvStore`](super::KvStore) test double, backed by `DashMap`
//! the way the orchestrator's in-process registries are, so unit tests never
//! need a SQLite file.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use crate::error::StoryResult;

use super::KvStore;

#[derive(Default)]
pub struct MemoryKvStore {
    data: DashMap<String, Bytes>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> StoryResult<Option<Bytes>> {
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: Bytes) -> StoryResult<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoryResult<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> StoryResult<Vec<String>> {
        Ok(self
            .data
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}
