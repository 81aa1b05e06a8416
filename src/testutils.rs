use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::memory::InMemory;
use parking_lot::Mutex;
use serde_json::Value;

use crate::blob::object::ObjectStoreBlobStore;
use crate::blob::{
    BlobEntry, BlobError, BlobResult, BlobStore, BlobVersion, StoredBlob,
};
use crate::data_types::{BlobId, Document};
use crate::repository::{RepositoryOptions, TableRepository};

pub fn make_blob_store() -> Arc<dyn BlobStore> {
    Arc::new(ObjectStoreBlobStore::new(Arc::new(InMemory::new())))
}

pub fn make_repository() -> TableRepository {
    TableRepository::new(make_blob_store(), RepositoryOptions::default())
}

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

#[derive(Debug, Default)]
struct Failures {
    reads: bool,
    writes: bool,
    creates: bool,
    deletes: bool,
    conflicts: bool,
}

/// Wraps a store and fails chosen kinds of calls on demand.
#[derive(Debug)]
pub struct FailingBlobStore {
    inner: Arc<dyn BlobStore>,
    failures: Mutex<Failures>,
}

fn injected(operation: &str) -> BlobError {
    BlobError::Generic {
        reason: format!("injected {operation} failure"),
    }
}

impl FailingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(Failures::default()),
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.failures.lock().reads = fail;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.failures.lock().writes = fail;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.failures.lock().creates = fail;
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.failures.lock().deletes = fail;
    }

    pub fn conflict_on_conditional_writes(&self, conflict: bool) {
        self.failures.lock().conflicts = conflict;
    }
}

#[async_trait]
impl BlobStore for FailingBlobStore {
    async fn create(&self, parent: &str, name: &str, content: Bytes) -> BlobResult<BlobId> {
        if self.failures.lock().creates {
            return Err(injected("create"));
        }
        self.inner.create(parent, name, content).await
    }

    async fn get(&self, id: &str) -> BlobResult<StoredBlob> {
        if self.failures.lock().reads {
            return Err(injected("get"));
        }
        self.inner.get(id).await
    }

    async fn get_fresh(&self, id: &str) -> BlobResult<StoredBlob> {
        if self.failures.lock().reads {
            return Err(injected("get"));
        }
        self.inner.get_fresh(id).await
    }

    async fn put(&self, id: &str, content: Bytes) -> BlobResult<BlobVersion> {
        if self.failures.lock().writes {
            return Err(injected("put"));
        }
        self.inner.put(id, content).await
    }

    async fn put_conditional(
        &self,
        id: &str,
        content: Bytes,
        expected: &BlobVersion,
    ) -> BlobResult<BlobVersion> {
        let (writes, conflicts) = {
            let failures = self.failures.lock();
            (failures.writes, failures.conflicts)
        };
        if writes {
            return Err(injected("put"));
        }
        if conflicts {
            return Err(BlobError::Conflict { id: id.to_string() });
        }
        self.inner.put_conditional(id, content, expected).await
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        if self.failures.lock().deletes {
            return Err(injected("delete"));
        }
        self.inner.delete(id).await
    }

    async fn list_by_parent(&self, parent: &str) -> BlobResult<Vec<BlobEntry>> {
        if self.failures.lock().reads {
            return Err(injected("list"));
        }
        self.inner.list_by_parent(parent).await
    }

    async fn list_by_name(&self, name: &str) -> BlobResult<Vec<BlobEntry>> {
        if self.failures.lock().reads {
            return Err(injected("list"));
        }
        self.inner.list_by_name(name).await
    }
}
