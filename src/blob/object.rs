use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore, PutMode, PutResult, UpdateVersion};
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BlobEntry, BlobError, BlobResult, BlobStore, BlobVersion, StoredBlob};
use crate::data_types::BlobId;

const BLOBS_PREFIX: &str = "blobs";
const ENTRIES_PREFIX: &str = "entries";

/// Blob store on top of any `object_store` backend.
///
/// Blob contents live at `blobs/{id}`. Since object stores have no notion of
/// a parent or a display name, every blob also gets an empty marker object at
/// `entries/{parent}/{name}/{id}` which the listing calls walk.
#[derive(Debug, Clone)]
pub struct ObjectStoreBlobStore {
    inner: Arc<dyn ObjectStore>,
}

impl ObjectStoreBlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    fn blob_path(id: &str) -> Path {
        Path::from_iter([BLOBS_PREFIX, id])
    }

    fn entry_path(parent: &str, name: &str, id: &str) -> Path {
        Path::from_iter([ENTRIES_PREFIX, parent, name, id])
    }

    async fn list_markers(&self, prefix: &Path) -> BlobResult<Vec<Marker>> {
        let metas: Vec<ObjectMeta> = match self.inner.list(Some(prefix)).try_collect().await {
            Ok(metas) => metas,
            // Nothing was ever written under this prefix
            Err(object_store::Error::NotFound { .. }) => vec![],
            Err(e) => return Err(e.into()),
        };

        let mut markers: Vec<Marker> = metas
            .into_iter()
            .filter_map(|meta| {
                parse_entry(&meta.location).map(|(parent, entry)| Marker {
                    location: meta.location,
                    parent,
                    entry,
                })
            })
            .collect();
        markers.sort_by(|a, b| {
            a.entry
                .name
                .cmp(&b.entry.name)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        Ok(markers)
    }
}

struct Marker {
    location: Path,
    parent: String,
    entry: BlobEntry,
}

impl Display for ObjectStoreBlobStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectStoreBlobStore({})", self.inner)
    }
}

/// Decode an `entries/{parent}/{name}/{id}` marker location.
fn parse_entry(location: &Path) -> Option<(String, BlobEntry)> {
    let parts = location
        .parts()
        .map(|part| {
            percent_decode_str(part.as_ref())
                .decode_utf8()
                .ok()
                .map(|s| s.into_owned())
        })
        .collect::<Option<Vec<String>>>()?;

    match parts.as_slice() {
        [prefix, parent, name, id] if prefix == ENTRIES_PREFIX => Some((
            parent.clone(),
            BlobEntry {
                id: id.clone(),
                name: name.clone(),
                trashed: false,
            },
        )),
        _ => None,
    }
}

fn map_error(id: &str, e: object_store::Error) -> BlobError {
    match e {
        object_store::Error::NotFound { .. } => BlobError::NotFound { id: id.to_string() },
        object_store::Error::Precondition { .. } => BlobError::Conflict { id: id.to_string() },
        e => BlobError::ObjectStore(e),
    }
}

fn version_of(result: PutResult) -> BlobVersion {
    BlobVersion {
        e_tag: result.e_tag,
        version: result.version,
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn create(&self, parent: &str, name: &str, content: Bytes) -> BlobResult<BlobId> {
        if parent.is_empty() || name.is_empty() {
            return Err(BlobError::Generic {
                reason: "Blobs need a non-empty parent and name".to_string(),
            });
        }

        let id = Uuid::new_v4().to_string();
        self.inner
            .put(&Self::blob_path(&id), content)
            .await
            .map_err(|e| map_error(&id, e))?;
        self.inner
            .put(&Self::entry_path(parent, name, &id), Bytes::new())
            .await
            .map_err(|e| map_error(&id, e))?;

        debug!("Created blob {id} ({parent}/{name})");
        Ok(id)
    }

    async fn get(&self, id: &str) -> BlobResult<StoredBlob> {
        let result = self
            .inner
            .get(&Self::blob_path(id))
            .await
            .map_err(|e| map_error(id, e))?;

        let version = BlobVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let content = result.bytes().await.map_err(|e| map_error(id, e))?;

        debug!("Fetched blob {id} ({} bytes)", content.len());
        Ok(StoredBlob { content, version })
    }

    async fn put(&self, id: &str, content: Bytes) -> BlobResult<BlobVersion> {
        let location = Self::blob_path(id);

        // Overwriting is the only thing `put` does; blobs come from `create`
        self.inner
            .head(&location)
            .await
            .map_err(|e| map_error(id, e))?;

        let size = content.len();
        let result = self
            .inner
            .put(&location, content)
            .await
            .map_err(|e| map_error(id, e))?;

        debug!("Overwrote blob {id} ({size} bytes)");
        Ok(version_of(result))
    }

    async fn put_conditional(
        &self,
        id: &str,
        content: Bytes,
        expected: &BlobVersion,
    ) -> BlobResult<BlobVersion> {
        if !expected.is_known() {
            warn!("No version known for blob {id}, overwriting unconditionally");
            return self.put(id, content).await;
        }

        let mode = PutMode::Update(UpdateVersion {
            e_tag: expected.e_tag.clone(),
            version: expected.version.clone(),
        });

        match self
            .inner
            .put_opts(&Self::blob_path(id), content.clone(), mode.into())
            .await
        {
            Ok(result) => {
                debug!("Conditionally overwrote blob {id}");
                Ok(version_of(result))
            }
            Err(object_store::Error::NotImplemented) => {
                warn!("Backend can't do conditional writes, overwriting blob {id}");
                self.put(id, content).await
            }
            Err(e) => Err(map_error(id, e)),
        }
    }

    async fn delete(&self, id: &str) -> BlobResult<()> {
        let location = Self::blob_path(id);
        self.inner
            .head(&location)
            .await
            .map_err(|e| map_error(id, e))?;
        self.inner
            .delete(&location)
            .await
            .map_err(|e| map_error(id, e))?;

        let markers = self
            .list_markers(&Path::from(ENTRIES_PREFIX))
            .await?
            .into_iter()
            .filter(|marker| marker.entry.id == id);
        for marker in markers {
            match self.inner.delete(&marker.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        debug!("Deleted blob {id}");
        Ok(())
    }

    async fn list_by_parent(&self, parent: &str) -> BlobResult<Vec<BlobEntry>> {
        let prefix = Path::from_iter([ENTRIES_PREFIX, parent]);
        Ok(self
            .list_markers(&prefix)
            .await?
            .into_iter()
            .filter(|marker| marker.parent == parent)
            .map(|marker| marker.entry)
            .collect())
    }

    async fn list_by_name(&self, name: &str) -> BlobResult<Vec<BlobEntry>> {
        Ok(self
            .list_markers(&Path::from(ENTRIES_PREFIX))
            .await?
            .into_iter()
            .map(|marker| marker.entry)
            .filter(|entry| entry.name == name)
            .collect())
    }
}
