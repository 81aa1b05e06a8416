//! Per-column unique indexes, each stored as its own blob.
//!
//! An index maps a column value to the ids of the documents holding it. The
//! table blob stays the source of truth: a stale or missing index weakens
//! uniqueness enforcement but never loses documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blob::BlobError;
use crate::data_types::{
    document_id, format_timestamp, Document, DocumentId, TableId,
};

mod manager;

pub use manager::{IndexChange, IndexManager, UniqueCheck};

pub const INDEX_SUFFIX: &str = ".index";

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("Failed (de)serializing index {name:?}: {reason}")]
    Serialization { name: String, reason: String },
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Deterministic blob name of a column's index, used to find the index again
/// when the schema's pointer to it is lost.
pub fn index_blob_name(table_id: &str, column: &str) -> String {
    format!("{table_id}_{column}{INDEX_SUFFIX}")
}

/// Key a value is filed under. Null and missing values are not indexed.
pub fn index_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    pub table_id: TableId,
    pub column: String,
    pub is_unique: bool,
    pub map: BTreeMap<String, Vec<DocumentId>>,
    pub updated_at: String,
}

impl IndexFile {
    pub fn new(table_id: &str, column: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            column: column.to_string(),
            is_unique: true,
            map: BTreeMap::new(),
            updated_at: format_timestamp(chrono::Utc::now()),
        }
    }

    /// Index every document of a table from scratch.
    pub fn from_documents(table_id: &str, column: &str, documents: &[Document]) -> Self {
        let mut index = Self::new(table_id, column);
        for document in documents {
            let key = document.get(column).and_then(index_key);
            if let (Some(key), Some(id)) = (key, document_id(document)) {
                index.add(&key, id);
            }
        }
        index
    }

    pub fn ids(&self, key: &str) -> &[DocumentId] {
        self.map.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// File `id` under `key`. Returns false if it was already there.
    pub fn add(&mut self, key: &str, id: &str) -> bool {
        let ids = self.map.entry(key.to_string()).or_default();
        if ids.iter().any(|existing| existing == id) {
            false
        } else {
            ids.push(id.to_string());
            true
        }
    }

    /// Take `id` out of `key`'s bucket, dropping the bucket once empty.
    /// Returns false if it wasn't there.
    pub fn remove(&mut self, key: &str, id: &str) -> bool {
        let Some(ids) = self.map.get_mut(key) else {
            return false;
        };
        let before = ids.len();
        ids.retain(|existing| existing != id);
        let removed = ids.len() != before;
        if ids.is_empty() {
            self.map.remove(key);
        }
        removed
    }

    /// Ids other than `exclude` holding `key`.
    pub fn holders<'a>(
        &'a self,
        key: &str,
        exclude: Option<&'a str>,
    ) -> impl Iterator<Item = &'a DocumentId> {
        self.ids(key)
            .iter()
            .filter(move |id| Some(id.as_str()) != exclude)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = format_timestamp(chrono::Utc::now());
    }
}
