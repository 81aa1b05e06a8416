/// In-memory read-through cache in front of a blob store.
/// Serves the read path only: anything doing read-modify-write goes through
/// `get_fresh`, which always hits the backend.
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;
use tracing::debug;

use super::{BlobEntry, BlobResult, BlobStore, BlobVersion, StoredBlob};
use crate::data_types::BlobId;

pub const DEFAULT_CACHE_CAPACITY: u64 = 1024;
pub const DEFAULT_CACHE_ENTRY_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CachingBlobStore {
    cache: Cache<BlobId, StoredBlob>,
    inner: Arc<dyn BlobStore>,
}

impl CachingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { cache, inner }
    }

    async fn fetch_and_cache(&self, id: &str) -> BlobResult<StoredBlob> {
        let blob = self.inner.get_fresh(id).await?;
        self.cache.insert(id.to_string(), blob.clone()).await;
        Ok(blob)
    }
}

impl Display for CachingBlobStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Caching wrapper around {:?}, {} entries cached",
            self.inner,
            self.cache.entry_count()
        )
    }
}

#[async_trait]
impl BlobStore for CachingBlobStore {
    async fn create(&self, parent: &str, name: &str, content: Bytes) -> BlobResult<BlobId> {
        self.inner.create(parent, name, content).await
    }

    async fn get(&self, id: &str) -> BlobResult<StoredBlob> {
        match self.cache.get(id).await {
            Some(blob) => {
                debug!("Cache value for blob {id} fetched from memory");
                Ok(blob)
            }
            None => self.fetch_and_cache(id).await,
        }
    }

    async fn get_fresh(&self, id: &str) -> BlobResult<StoredBlob> {
        self.fetch_and_cache(id).await
    }

    async fn put(&self, id: &str, content: Bytes) -> BlobResult<BlobVersion> {
        self.cache.invalidate(id).await;
        let result = self.inner.put(id, content).await;
        // A read racing the write may have cached the old content meanwhile
        self.cache.invalidate(id).await;
        result
    }

    async fn put_conditional(
        &self,
        id: &str,
        content: Bytes,
        expected: &BlobVersion,
    ) -> BlobResult<BlobVersion> {
        self.cache.invalidate(id).await;
        let result = self.inner.put_conditional(id, content, expected).await;
        self.cache.invalidate(id).await;
        result
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        self.cache.invalidate(id).await;
        let result = self.inner.delete(id).await;
        self.cache.invalidate(id).await;
        result
    }

    async fn list_by_parent(&self, parent: &str) -> BlobResult<Vec<BlobEntry>> {
        self.inner.list_by_parent(parent).await
    }

    async fn list_by_name(&self, name: &str) -> BlobResult<Vec<BlobEntry>> {
        self.inner.list_by_name(name).await
    }
}
