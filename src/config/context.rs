use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::blob::cache::CachingBlobStore;
use crate::blob::object::ObjectStoreBlobStore;
use crate::blob::{BlobResult, BlobStore};
use crate::context::BlobtableContext;
use crate::repository::TableRepository;
use crate::schema::ValidatorCache;

use super::schema::BlobtableConfig;

pub fn build_blob_store(config: &BlobtableConfig) -> BlobResult<Arc<dyn BlobStore>> {
    let object_store = config.object_store.build_object_store()?;
    if config.object_store.is_ephemeral() {
        warn!("Using an in-memory object store, all tables will be lost on exit");
    }

    let store: Arc<dyn BlobStore> = Arc::new(ObjectStoreBlobStore::new(object_store));

    Ok(match &config.cache {
        Some(cache) => {
            info!(
                "Caching blob reads (capacity {}, ttl {}s)",
                cache.capacity, cache.ttl_secs
            );
            Arc::new(CachingBlobStore::new(
                store,
                cache.capacity,
                Duration::from_secs(cache.ttl_secs),
            ))
        }
        None => store,
    })
}

pub fn build_context(config: &BlobtableConfig) -> BlobResult<BlobtableContext> {
    let store = build_blob_store(config)?;
    let repository = TableRepository::new(store, config.store.repository_options())
        .with_validator_cache(ValidatorCache::new(config.misc.validator_cache_size));

    Ok(BlobtableContext::new(
        Arc::new(repository),
        config.misc.session(),
    ))
}
