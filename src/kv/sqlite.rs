//! SQLite-backed [`KvStore`](super::KvStore), the production-shaped
//! implementation: a `SqlitePool`, `new`/`new_in_memory` constructors, and
//! runtime-checked `sqlx::query(...)` builders rather than the `query!`
//! compile-time macro, since there is no `DATABASE_URL` available at
//! build time here.

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use crate::error::{StoryError, StoryResult};

use super::KvStore;

pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    pub async fn new(database_url: &str) -> StoryResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> StoryResult<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn init_schema(pool: &SqlitePool) -> StoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL
            )",
        )
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> StoryResult<Option<Bytes>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoryError::kv("get", e.to_string()))?;

        Ok(row.map(|r| Bytes::from(r.get::<Vec<u8>, _>("value"))))
    }

    async fn set(&self, key: &str, value: Bytes) -> StoryResult<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value.to_vec())
        .execute(&self.pool)
        .await
        .map_err(|e| StoryError::kv("set", e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> StoryResult<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StoryError::kv("delete", e.to_string()))?;

        Ok(())
    }

    async fn scan(&self, prefix: &str) -> StoryResult<Vec<String>> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query("SELECT key FROM kv WHERE key LIKE ? ESCAPE '\\'")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoryError::kv("scan", e.to_string()))?;

        Ok(rows.into_iter().map(|r| r.get::<String, _>("key")).collect())
    }
}
