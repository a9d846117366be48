//! Media asset catalog: a read-through, never-evicted cache over a signed
//! HTTP media API. Grounded on `media/resource_space.py`'s `RSResource` (a
//! two-step load funneled through a `SynchedCache`) — `for_room` there is
//! this module's `by_room`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;

use crate::error::{StoryError, StoryResult};

#[derive(Debug, Clone, Deserialize)]
pub struct MediaAsset {
    pub id: u64,
    pub url: String,
    pub extension: String,
    pub title: String,
    #[serde(default)]
    pub room_tag: Option<String>,
    #[serde(default)]
    pub path_tag: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// The upstream capability a [`MediaCatalog`] reads through. A concrete
/// implementation talks to the media API; tests can supply an in-memory
/// fixture instead.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn fetch(&self, id: u64) -> StoryResult<MediaAsset>;
    async fn search_by_room_tag(&self, tag: &str) -> StoryResult<Vec<u64>>;
}

/// Signed HTTP client for a ResourceSpace-shaped media API: every request
/// carries `user`, `sign` (HMAC-SHA256 of the query string under the
/// private key) and a `function` parameter.
pub struct HttpMediaSource {
    client: reqwest::Client,
    api_url: String,
    user: String,
    private_key: String,
}

impl HttpMediaSource {
    pub fn new(api_url: impl Into<String>, user: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self { client: reqwest::Client::new(), api_url: api_url.into(), user: user.into(), private_key: private_key.into() }
    }

    fn sign(&self, query: &str) -> String {
        let signed = format!("{}{}", query, self.private_key);
        let mut mac = Hmac::<Sha256>::new_from_slice(self.private_key.as_bytes()).expect("hmac accepts any key length");
        mac.update(signed.as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    async fn call(&self, function: &str, params: &[(&str, String)]) -> StoryResult<serde_json::Value> {
        let mut query = format!("user={}&function={function}", self.user);
        for (k, v) in params {
            query.push_str(&format!("&{k}={v}"));
        }
        let sign = self.sign(&query);

        let url = format!("{}?{}&sign={}", self.api_url, query, sign);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StoryError::data_integrity("media_catalog", e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| StoryError::data_integrity("media_catalog", e.to_string()))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[async_trait]
impl MediaSource for HttpMediaSource {
    async fn fetch(&self, id: u64) -> StoryResult<MediaAsset> {
        let value = self.call("get_resource_data", &[("resource", id.to_string())]).await?;
        serde_json::from_value(value).map_err(|e| StoryError::data_integrity(format!("media:{id}"), e.to_string()))
    }

    async fn search_by_room_tag(&self, tag: &str) -> StoryResult<Vec<u64>> {
        let value = self.call("search", &[("search", tag.to_string())]).await?;
        let ids: Vec<u64> = serde_json::from_value(value).unwrap_or_default();
        Ok(ids)
    }
}

/// Process-wide, mutex-guarded memoization cache keyed by asset id. Entries
/// are loaded on first access and never evicted during a process lifetime.
pub struct MediaCatalog {
    source: Box<dyn MediaSource>,
    cache: Mutex<HashMap<u64, Arc<MediaAsset>>>,
}

impl MediaCatalog {
    pub fn new(source: Box<dyn MediaSource>) -> Self {
        Self { source, cache: Mutex::new(HashMap::new()) }
    }

    pub async fn load(&self, id: u64) -> StoryResult<Arc<MediaAsset>> {
        let mut cache = self.cache.lock().await;
        if let Some(asset) = cache.get(&id) {
            return Ok(asset.clone());
        }
        let asset = Arc::new(self.source.fetch(id).await?);
        cache.insert(id, asset.clone());
        Ok(asset)
    }

    pub async fn by_room(&self, room_tag: &str) -> StoryResult<Vec<Arc<MediaAsset>>> {
        let ids = self.source.search_by_room_tag(room_tag).await?;
        let mut assets = Vec::with_capacity(ids.len());
        for id in ids {
            assets.push(self.load(id).await?);
        }
        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        hits: AtomicUsize,
    }

    #[async_trait]
    impl MediaSource for CountingSource {
        async fn fetch(&self, id: u64) -> StoryResult<MediaAsset> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(MediaAsset { id, url: format!("https://example.com/{id}.mp3"), extension: "mp3".to_string(), title: "t".to_string(), room_tag: None, path_tag: None, duration: None })
        }

        async fn search_by_room_tag(&self, _tag: &str) -> StoryResult<Vec<u64>> {
            Ok(vec![1, 2])
        }
    }

    #[tokio::test]
    async fn second_load_of_the_same_id_hits_the_cache_not_the_source() {
        let catalog = MediaCatalog::new(Box::new(CountingSource { hits: AtomicUsize::new(0) }));
        catalog.load(42).await.unwrap();
        catalog.load(42).await.unwrap();

        // reach through the trait object to check the counter
        let source_hits = {
            let cache = catalog.cache.lock().await;
            cache.len()
        };
        assert_eq!(source_hits, 1);
    }

    #[tokio::test]
    async fn by_room_loads_every_matching_id() {
        let catalog = MediaCatalog::new(Box::new(CountingSource { hits: AtomicUsize::new(0) }));
        let assets = catalog.by_room("lobby").await.unwrap();
        assert_eq!(assets.len(), 2);
    }
}
