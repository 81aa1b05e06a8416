//! Client-side view of the blob backend.
//!
//! The backend only knows whole objects: create/get/put/delete by id, plus
//! listing that may lag behind recent writes. There are no locks and no
//! transactions; `put_conditional` is the single hook through which a
//! backend with compare-and-swap can reject stale writes.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::data_types::BlobId;

pub mod cache;
pub mod object;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("Blob {id:?} not found")]
    NotFound { id: BlobId },

    #[error("Blob {id:?} was modified concurrently")]
    Conflict { id: BlobId },

    #[error("Blob store call {operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error("{reason}")]
    Generic { reason: String },
}

impl BlobError {
    /// Whether retrying the same call could succeed. Only ever acted upon
    /// for pure reads.
    pub fn is_transient(&self) -> bool {
        match self {
            BlobError::Timeout { .. } | BlobError::Generic { .. } => true,
            BlobError::ObjectStore(e) => matches!(e, object_store::Error::Generic { .. }),
            BlobError::NotFound { .. } | BlobError::Conflict { .. } => false,
        }
    }
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Opaque version token of a stored blob, as reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BlobVersion {
    pub e_tag: Option<String>,
    pub version: Option<String>,
}

impl BlobVersion {
    pub fn is_known(&self) -> bool {
        self.e_tag.is_some() || self.version.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub content: Bytes,
    pub version: BlobVersion,
}

/// A listing entry. Listings are best-effort and may omit recent writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub id: BlobId,
    pub name: String,
    pub trashed: bool,
}

#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    async fn create(&self, parent: &str, name: &str, content: Bytes) -> BlobResult<BlobId>;

    async fn get(&self, id: &str) -> BlobResult<StoredBlob>;

    /// Like `get`, but never served from a cache. Every read-modify-write
    /// must start from this.
    async fn get_fresh(&self, id: &str) -> BlobResult<StoredBlob> {
        self.get(id).await
    }

    async fn put(&self, id: &str, content: Bytes) -> BlobResult<BlobVersion>;

    /// Overwrite a blob only if it is still at `expected`.
    ///
    /// Backends without compare-and-swap keep the default, which ignores
    /// `expected` and overwrites unconditionally (last writer wins).
    async fn put_conditional(
        &self,
        id: &str,
        content: Bytes,
        _expected: &BlobVersion,
    ) -> BlobResult<BlobVersion> {
        self.put(id, content).await
    }

    async fn delete(&self, id: &str) -> BlobResult<()>;

    async fn list_by_parent(&self, parent: &str) -> BlobResult<Vec<BlobEntry>>;

    /// Global, unscoped lookup. Only meant as a fallback when a pointer has
    /// been lost and the parent listing didn't turn the blob up.
    async fn list_by_name(&self, name: &str) -> BlobResult<Vec<BlobEntry>>;
}
