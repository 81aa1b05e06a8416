//! Table Blob Repository: CRUD over tables persisted as one blob each.

use serde_json::Value;

use crate::blob::BlobError;
use crate::data_types::{DocumentId, TableId};
use crate::index::IndexError;
use crate::query::QueryError;
use crate::schema::{SchemaError, ValidationErrors};

mod table;

pub use table::{
    RepositoryOptions, TableBlob, TableRepository, TableSummary, DEFAULT_ROOT, TABLE_SUFFIX,
};

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("unique constraint failed for field {field}")]
    UniqueConstraint { field: String, value: Value },

    #[error("Table {id:?} doesn't exist")]
    TableNotFound { id: TableId },

    #[error("Document {id:?} not found")]
    DocumentNotFound { id: DocumentId },

    #[error("Column {key:?} doesn't exist")]
    ColumnNotFound { key: String },

    #[error("Column {key:?} already exists")]
    ColumnAlreadyExists { key: String },

    #[error("Table {name:?} already exists")]
    TableAlreadyExists { name: String },

    #[error("Column {key:?} is a system column")]
    SystemColumn { key: String },

    #[error("Column {key:?} isn't unique, so it has no index")]
    ColumnNotUnique { key: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("Table {id:?} was modified concurrently, reload and try again")]
    Conflict { id: TableId },

    #[error("Blob store error: {0}")]
    Backend(BlobError),

    #[error("Failed (de)serializing {id:?}: {reason}")]
    Serialization { id: String, reason: String },
}

impl TableError {
    /// Whether the caller may run the whole operation again. Nothing is ever
    /// retried internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TableError::Conflict { .. })
    }
}

impl From<BlobError> for TableError {
    fn from(err: BlobError) -> TableError {
        match err {
            BlobError::Conflict { id } => TableError::Conflict { id },
            e => TableError::Backend(e),
        }
    }
}

impl From<IndexError> for TableError {
    fn from(err: IndexError) -> TableError {
        match err {
            IndexError::Blob(e) => e.into(),
            IndexError::Serialization { name, reason } => {
                TableError::Serialization { id: name, reason }
            }
        }
    }
}

pub type TableResult<T, E = TableError> = Result<T, E>;

/// Map column-definition problems onto the operation-level taxonomy.
pub(crate) fn column_error(err: SchemaError) -> TableError {
    match err {
        SchemaError::DuplicateKey { key } => TableError::ColumnAlreadyExists { key },
        SchemaError::ReservedKey { key } => TableError::SystemColumn { key },
        e => TableError::Schema(e),
    }
}
