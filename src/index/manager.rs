use std::sync::Arc;

use bytes::Bytes;
use itertools::Itertools;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{index_blob_name, index_key, IndexError, IndexFile, IndexResult};
use crate::blob::{BlobError, BlobStore, BlobVersion};
use crate::data_types::{BlobId, Document, DocumentId};
use crate::session::Session;

/// Outcome of a uniqueness pre-check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueCheck {
    pub safe: bool,
    pub error: Option<String>,
    /// Documents the index says already hold the value.
    pub holders: Vec<DocumentId>,
}

impl UniqueCheck {
    pub fn safe() -> Self {
        Self {
            safe: true,
            error: None,
            holders: vec![],
        }
    }

    pub fn violated(column: &str, holders: Vec<DocumentId>) -> Self {
        Self {
            safe: false,
            error: Some(format!("unique constraint failed for field {column}")),
            holders,
        }
    }
}

/// One document moving from `old` to `new` within a column.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexChange {
    pub doc_id: DocumentId,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl IndexChange {
    pub fn insert(doc_id: &str, new: Option<&Value>) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            old: None,
            new: new.cloned(),
        }
    }

    pub fn retract(doc_id: &str, old: Option<&Value>) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            old: old.cloned(),
            new: None,
        }
    }
}

struct LoadedIndex {
    id: BlobId,
    index: IndexFile,
    version: BlobVersion,
}

/// Sole owner of index blob lifecycle. Index blobs are created under the
/// same parent as the tables they belong to.
#[derive(Debug, Clone)]
pub struct IndexManager {
    store: Arc<dyn BlobStore>,
    root: String,
    conditional_writes: bool,
}

impl IndexManager {
    pub fn new(store: Arc<dyn BlobStore>, root: &str, conditional_writes: bool) -> Self {
        Self {
            store,
            root: root.to_string(),
            conditional_writes,
        }
    }

    /// Ids of every live index blob named after this column. Normally zero or
    /// one; more only if two writers raced to create the index.
    async fn discover(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
    ) -> IndexResult<Vec<BlobId>> {
        let name = index_blob_name(table_id, column);
        let store = &self.store;
        let root = self.root.as_str();

        let under_root = session
            .read("list_by_parent", move || store.list_by_parent(root))
            .await?;
        let found = under_root
            .into_iter()
            .filter(|e| e.name == name && !e.trashed)
            .map(|e| e.id)
            .collect_vec();
        if !found.is_empty() {
            return Ok(found);
        }

        debug!("Index {name} not listed under {root}, trying a global lookup");
        let name_ref = name.as_str();
        let anywhere = session
            .read("list_by_name", move || store.list_by_name(name_ref))
            .await?;
        Ok(anywhere
            .into_iter()
            .filter(|e| !e.trashed)
            .map(|e| e.id)
            .collect())
    }

    async fn fetch(&self, session: &Session, id: &str) -> IndexResult<Option<LoadedIndex>> {
        let store = &self.store;
        let blob = match session.read("get", move || store.get_fresh(id)).await {
            Ok(blob) => blob,
            Err(BlobError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let index: IndexFile =
            serde_json::from_slice(&blob.content).map_err(|e| IndexError::Serialization {
                name: id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Some(LoadedIndex {
            id: id.to_string(),
            index,
            version: blob.version,
        }))
    }

    /// Load a column's index, preferring the schema's pointer and falling
    /// back to name-based discovery when there is none or it is dangling.
    async fn load(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
        pointer: Option<&str>,
    ) -> IndexResult<Option<LoadedIndex>> {
        if let Some(id) = pointer {
            if let Some(loaded) = self.fetch(session, id).await? {
                return Ok(Some(loaded));
            }
            warn!("Index {id} for {table_id}.{column} is gone, looking it up by name");
        }

        for id in self.discover(session, table_id, column).await? {
            if Some(id.as_str()) == pointer {
                continue;
            }
            // Listings can be stale, so a listed blob may already be deleted
            if let Some(loaded) = self.fetch(session, &id).await? {
                return Ok(Some(loaded));
            }
        }
        Ok(None)
    }

    fn serialize(index: &IndexFile) -> IndexResult<Bytes> {
        serde_json::to_vec(index)
            .map(Bytes::from)
            .map_err(|e| IndexError::Serialization {
                name: index.column.clone(),
                reason: e.to_string(),
            })
    }

    async fn save(&self, session: &Session, loaded: &mut LoadedIndex) -> IndexResult<()> {
        loaded.index.touch();
        let content = Self::serialize(&loaded.index)?;
        let version = if self.conditional_writes {
            session
                .write(
                    "put_conditional",
                    self.store
                        .put_conditional(&loaded.id, content, &loaded.version),
                )
                .await?
        } else {
            session
                .write("put", self.store.put(&loaded.id, content))
                .await?
        };
        loaded.version = version;
        Ok(())
    }

    async fn create(&self, session: &Session, index: &IndexFile) -> IndexResult<BlobId> {
        let name = index_blob_name(&index.table_id, &index.column);
        let content = Self::serialize(index)?;
        let id = session
            .write("create", self.store.create(&self.root, &name, content))
            .await?;
        info!("Created index {name} ({id})");
        Ok(id)
    }

    async fn delete_blob(&self, session: &Session, id: &str) {
        match session.write("delete", self.store.delete(id)).await {
            Ok(()) | Err(BlobError::NotFound { .. }) => {}
            Err(e) => warn!("Failed to delete index blob {id}: {e}"),
        }
    }

    /// Check that no document other than `exclude` holds `value` in `column`.
    ///
    /// Backend errors propagate: a check that couldn't run is not a pass. A
    /// column without any index has no constraint to check against.
    pub async fn check_unique(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
        value: &Value,
        exclude: Option<&str>,
        pointer: Option<&str>,
    ) -> IndexResult<UniqueCheck> {
        let Some(key) = index_key(value) else {
            return Ok(UniqueCheck::safe());
        };
        let Some(loaded) = self.load(session, table_id, column, pointer).await? else {
            debug!("No index for {table_id}.{column}, nothing to check against");
            return Ok(UniqueCheck::safe());
        };

        let holders = loaded.index.holders(&key, exclude).cloned().collect_vec();
        if holders.is_empty() {
            Ok(UniqueCheck::safe())
        } else {
            Ok(UniqueCheck::violated(column, holders))
        }
    }

    /// Apply one document's value change to the column's index.
    ///
    /// Returns the index blob id when it differs from `pointer`, i.e. when
    /// the index was just created or found by name. The caller must then
    /// store it on the column definition.
    pub async fn update(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
        old: Option<&Value>,
        new: Option<&Value>,
        doc_id: &str,
        pointer: Option<&str>,
    ) -> IndexResult<Option<BlobId>> {
        let change = IndexChange {
            doc_id: doc_id.to_string(),
            old: old.cloned(),
            new: new.cloned(),
        };
        self.apply(session, table_id, column, &[change], pointer)
            .await
    }

    /// Apply several changes in a single read-modify-write of the index.
    pub async fn apply(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
        changes: &[IndexChange],
        pointer: Option<&str>,
    ) -> IndexResult<Option<BlobId>> {
        let keyed = changes
            .iter()
            .map(|c| {
                (
                    c.doc_id.as_str(),
                    c.old.as_ref().and_then(index_key),
                    c.new.as_ref().and_then(index_key),
                )
            })
            .collect_vec();

        let Some(mut loaded) = self.load(session, table_id, column, pointer).await? else {
            // Only materialize an index when there is something to put in it
            let mut index = IndexFile::new(table_id, column);
            for (doc_id, _, new) in &keyed {
                if let Some(new) = new {
                    index.add(new, doc_id);
                }
            }
            if index.map.is_empty() {
                return Ok(None);
            }
            return self.create(session, &index).await.map(Some);
        };

        let mut changed = false;
        for (doc_id, old, new) in &keyed {
            if old != new {
                if let Some(old) = old {
                    changed |= loaded.index.remove(old, doc_id);
                }
            }
            if let Some(new) = new {
                changed |= loaded.index.add(new, doc_id);
            }
        }

        if changed {
            self.save(session, &mut loaded).await?;
            debug!("Updated index {} for {table_id}.{column}", loaded.id);
        }

        Ok((Some(loaded.id.as_str()) != pointer).then_some(loaded.id))
    }

    /// Replace the column's index with one computed from `documents`.
    pub async fn rebuild(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
        documents: &[Document],
        pointer: Option<&str>,
    ) -> IndexResult<BlobId> {
        self.delete(session, table_id, column, pointer).await;

        let index = IndexFile::from_documents(table_id, column, documents);
        let id = self.create(session, &index).await?;
        info!(
            "Rebuilt index for {table_id}.{column} over {} documents ({} distinct values)",
            documents.len(),
            index.map.len()
        );
        Ok(id)
    }

    /// Best-effort removal of every index blob of a column. Failures are
    /// logged; a missing index simply means no constraint from here on.
    pub async fn delete(
        &self,
        session: &Session,
        table_id: &str,
        column: &str,
        pointer: Option<&str>,
    ) {
        let mut ids = pointer.map(str::to_string).into_iter().collect_vec();
        match self.discover(session, table_id, column).await {
            Ok(found) => ids.extend(found),
            Err(e) => warn!("Failed to look up indexes of {table_id}.{column}: {e}"),
        }

        for id in ids.into_iter().unique() {
            self.delete_blob(session, &id).await;
        }
    }
}
