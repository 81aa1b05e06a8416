use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{column_error, TableError, TableResult};
use crate::blob::{BlobError, BlobStore, BlobVersion};
use crate::data_types::{
    document_id, format_timestamp, is_system_field, next_timestamp, user_fields, BlobId,
    Document, DocumentId, TableId, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};
use crate::index::{index_key, IndexChange, IndexManager, UniqueCheck};
use crate::query::{apply_query, Query, QueryResult};
use crate::schema::{
    check_new_columns, compile, system_columns, ColumnDefinition, ValidatorCache, Validator,
};
use crate::session::Session;

pub const TABLE_SUFFIX: &str = ".table";
pub const DEFAULT_ROOT: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryOptions {
    /// Parent id that table and index blobs are created under
    pub root: String,
    /// Save through `put_conditional` and fail on concurrent modification
    pub conditional_writes: bool,
    /// Take deleted documents out of unique indexes
    pub retract_on_delete: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            conditional_writes: false,
            retract_on_delete: true,
        }
    }
}

/// A whole table as persisted: one blob holds the schema and every document.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TableBlob {
    pub name: String,
    pub schema: Vec<ColumnDefinition>,
    #[serde(default)]
    pub documents: Vec<Document>,
}

impl TableBlob {
    pub fn new(name: &str, columns: Vec<ColumnDefinition>) -> Self {
        let mut schema = system_columns();
        schema.extend(columns);
        Self {
            name: name.to_string(),
            schema,
            documents: vec![],
        }
    }

    pub fn column(&self, key: &str) -> Option<&ColumnDefinition> {
        self.schema.iter().find(|c| c.key == key)
    }

    fn column_mut(&mut self, key: &str) -> Option<&mut ColumnDefinition> {
        self.schema.iter_mut().find(|c| c.key == key)
    }

    pub fn document(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| document_id(d) == Some(id))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.documents.iter().position(|d| document_id(d) == Some(id))
    }

    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnDefinition> {
        self.schema.iter().filter(|c| c.unique && !c.is_system())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    pub id: TableId,
    pub name: String,
}

struct LoadedTable {
    id: TableId,
    table: TableBlob,
    version: BlobVersion,
}

fn serialize(id: &str, table: &TableBlob) -> TableResult<Bytes> {
    serde_json::to_vec(table)
        .map(Bytes::from)
        .map_err(|e| TableError::Serialization {
            id: id.to_string(),
            reason: e.to_string(),
        })
}

/// First value held by more than one document in `column`, if any.
fn first_duplicate(documents: &[Document], column: &str) -> Option<Value> {
    let mut seen = HashSet::new();
    documents
        .iter()
        .filter_map(|d| d.get(column))
        .find(|value| index_key(value).map_or(false, |key| !seen.insert(key)))
        .cloned()
}

fn not_found_as_table(id: &str) -> impl FnOnce(BlobError) -> TableError + '_ {
    move |e| match e {
        BlobError::NotFound { .. } => TableError::TableNotFound { id: id.to_string() },
        e => e.into(),
    }
}

/// Schema-enforcing CRUD over table blobs.
///
/// Every mutation is a read-modify-write of the whole table blob, loaded
/// fresh. Without `conditional_writes`, two concurrent mutations of the same
/// table race and the last writer wins. Uniqueness is checked before the
/// write and indexed after it, so two concurrent inserts of the same value
/// can both succeed.
#[derive(Debug, Clone)]
pub struct TableRepository {
    store: Arc<dyn BlobStore>,
    indexes: IndexManager,
    validators: ValidatorCache,
    options: RepositoryOptions,
}

impl TableRepository {
    pub fn new(store: Arc<dyn BlobStore>, options: RepositoryOptions) -> Self {
        let indexes = IndexManager::new(store.clone(), &options.root, options.conditional_writes);
        Self {
            store,
            indexes,
            validators: ValidatorCache::default(),
            options,
        }
    }

    pub fn with_validator_cache(self, validators: ValidatorCache) -> Self {
        Self { validators, ..self }
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn options(&self) -> &RepositoryOptions {
        &self.options
    }

    async fn load(&self, session: &Session, id: &str, fresh: bool) -> TableResult<LoadedTable> {
        let store = &self.store;
        let blob = session
            .read("get", move || {
                if fresh {
                    store.get_fresh(id)
                } else {
                    store.get(id)
                }
            })
            .await
            .map_err(not_found_as_table(id))?;

        let table = serde_json::from_slice(&blob.content).map_err(|e| {
            TableError::Serialization {
                id: id.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(LoadedTable {
            id: id.to_string(),
            table,
            version: blob.version,
        })
    }

    async fn save(&self, session: &Session, loaded: &mut LoadedTable) -> TableResult<()> {
        let content = serialize(&loaded.id, &loaded.table)?;
        let result = if self.options.conditional_writes {
            session
                .write(
                    "put_conditional",
                    self.store
                        .put_conditional(&loaded.id, content, &loaded.version),
                )
                .await
        } else {
            session
                .write("put", self.store.put(&loaded.id, content))
                .await
        };
        loaded.version = result.map_err(not_found_as_table(&loaded.id))?;
        Ok(())
    }

    fn validator(&self, table: &TableBlob) -> TableResult<Arc<Validator>> {
        Ok(self.validators.get_or_compile(&table.schema)?)
    }

    /// Create an empty table named `name` with the system columns plus
    /// `columns`. Returns the id of the new table blob.
    pub async fn create(
        &self,
        session: &Session,
        name: &str,
        columns: Vec<ColumnDefinition>,
    ) -> TableResult<TableId> {
        check_new_columns(&system_columns(), &columns).map_err(column_error)?;

        // Listing is best-effort, so this only catches the common case
        if self.list_tables(session).await?.iter().any(|t| t.name == name) {
            return Err(TableError::TableAlreadyExists {
                name: name.to_string(),
            });
        }

        // Index pointers are only ever set by the index manager
        let columns = columns
            .into_iter()
            .map(|c| ColumnDefinition {
                index_file_id: None,
                ..c
            })
            .collect();
        let table = TableBlob::new(name, columns);
        let content = serialize(name, &table)?;
        let blob_name = format!("{name}{TABLE_SUFFIX}");
        let id = session
            .write(
                "create",
                self.store.create(&self.options.root, &blob_name, content),
            )
            .await?;

        info!("Created table {name:?} ({id})");
        Ok(id)
    }

    pub async fn list_tables(&self, session: &Session) -> TableResult<Vec<TableSummary>> {
        let store = &self.store;
        let root = self.options.root.as_str();
        let entries = session
            .read("list_by_parent", move || store.list_by_parent(root))
            .await?;

        Ok(entries
            .into_iter()
            .filter(|e| !e.trashed)
            .filter_map(|e| {
                e.name.strip_suffix(TABLE_SUFFIX).map(|name| TableSummary {
                    id: e.id.clone(),
                    name: name.to_string(),
                })
            })
            .collect())
    }

    pub async fn get_table(&self, session: &Session, table_id: &str) -> TableResult<TableBlob> {
        Ok(self.load(session, table_id, false).await?.table)
    }

    pub async fn get_document(
        &self,
        session: &Session,
        table_id: &str,
        doc_id: &str,
    ) -> TableResult<Document> {
        let loaded = self.load(session, table_id, false).await?;
        loaded
            .table
            .document(doc_id)
            .cloned()
            .ok_or_else(|| TableError::DocumentNotFound {
                id: doc_id.to_string(),
            })
    }

    /// Filter, sort and paginate a table's documents.
    pub async fn read(
        &self,
        session: &Session,
        table_id: &str,
        query: &Query,
    ) -> TableResult<QueryResult> {
        let loaded = self.load(session, table_id, false).await?;
        Ok(apply_query(
            &loaded.table.documents,
            &loaded.table.schema,
            query,
        )?)
    }

    /// Validate a payload against a table's schema without writing anything.
    pub async fn validate_document(
        &self,
        session: &Session,
        table_id: &str,
        payload: &Document,
    ) -> TableResult<Document> {
        let loaded = self.load(session, table_id, false).await?;
        Ok(self.validator(&loaded.table)?.validate(payload)?)
    }

    /// Check whether `value` is free in a unique column, without writing
    /// anything. Always safe for columns that aren't unique.
    pub async fn check_unique(
        &self,
        session: &Session,
        table_id: &str,
        key: &str,
        value: &Value,
        exclude: Option<&str>,
    ) -> TableResult<UniqueCheck> {
        let loaded = self.load(session, table_id, true).await?;
        let column = loaded
            .table
            .column(key)
            .ok_or_else(|| TableError::ColumnNotFound {
                key: key.to_string(),
            })?;
        if !column.unique {
            return Ok(UniqueCheck::safe());
        }
        self.unique_check(session, &loaded, column, value, exclude)
            .await
    }

    async fn unique_check(
        &self,
        session: &Session,
        loaded: &LoadedTable,
        column: &ColumnDefinition,
        value: &Value,
        exclude: Option<&str>,
    ) -> TableResult<UniqueCheck> {
        let check = self
            .indexes
            .check_unique(
                session,
                &loaded.id,
                &column.key,
                value,
                exclude,
                column.index_file_id.as_deref(),
            )
            .await?;
        if check.safe {
            return Ok(check);
        }

        // The index may lag behind the documents; only live holders count
        let key = index_key(value);
        let (live, stale): (Vec<DocumentId>, Vec<DocumentId>) =
            check.holders.into_iter().partition(|id| {
                loaded
                    .table
                    .document(id)
                    .map_or(false, |d| d.get(&column.key).and_then(index_key) == key)
            });
        if !stale.is_empty() {
            warn!(
                "Index of {}.{} lists stale holders {stale:?}",
                loaded.id, column.key
            );
        }

        Ok(if live.is_empty() {
            UniqueCheck::safe()
        } else {
            UniqueCheck::violated(&column.key, live)
        })
    }

    /// Fail if any unique column value of `fields` is already taken. With
    /// `previous`, columns whose value didn't change are skipped.
    async fn ensure_unique(
        &self,
        session: &Session,
        loaded: &LoadedTable,
        fields: &Document,
        exclude: Option<&str>,
        previous: Option<&Document>,
    ) -> TableResult<()> {
        for column in loaded.table.unique_columns() {
            let Some(value) = fields.get(&column.key) else {
                continue;
            };
            if let Some(previous) = previous {
                if previous.get(&column.key).and_then(index_key) == index_key(value) {
                    continue;
                }
            }

            let check = self
                .unique_check(session, loaded, column, value, exclude)
                .await?;
            if !check.safe {
                return Err(TableError::UniqueConstraint {
                    field: column.key.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Bring indexes up to date after a committed table save.
    ///
    /// The table is already persisted at this point, so failures are logged
    /// rather than returned. If an index blob was created or rediscovered,
    /// its id is stored on the column and the table saved once more.
    async fn sync_indexes(
        &self,
        session: &Session,
        loaded: &mut LoadedTable,
        changes: Vec<(String, Vec<IndexChange>)>,
    ) {
        let mut repointed = false;
        for (key, mut changes) in changes {
            changes.retain(|c| c.old.is_some() || c.new.is_some());
            if changes.is_empty() {
                continue;
            }

            let pointer = loaded
                .table
                .column(&key)
                .and_then(|c| c.index_file_id.clone());
            match self
                .indexes
                .apply(session, &loaded.id, &key, &changes, pointer.as_deref())
                .await
            {
                Ok(Some(index_id)) => {
                    if let Some(column) = loaded.table.column_mut(&key) {
                        debug!("Pointing {}.{key} at index {index_id}", loaded.id);
                        column.index_file_id = Some(index_id);
                        repointed = true;
                    }
                }
                Ok(None) => {}
                Err(e) => error!(
                    "Index update of {}.{key} failed after the table was saved: {e}",
                    loaded.id
                ),
            }
        }

        if repointed {
            // Not fatal: the index can still be found by name
            if let Err(e) = self.save(session, loaded).await {
                error!("Failed to save index pointers of table {}: {e}", loaded.id);
            }
        }
    }

    pub async fn add_document(
        &self,
        session: &Session,
        table_id: &str,
        payload: &Document,
    ) -> TableResult<Document> {
        let mut loaded = self.load(session, table_id, true).await?;
        let fields = self.validator(&loaded.table)?.validate(payload)?;
        self.ensure_unique(session, &loaded, &fields, None, None)
            .await?;

        let doc_id = Uuid::new_v4().to_string();
        let now = Value::String(format_timestamp(Utc::now()));
        let mut document = Document::new();
        document.insert(ID_FIELD.to_string(), Value::String(doc_id.clone()));
        document.insert(CREATED_AT_FIELD.to_string(), now.clone());
        document.insert(UPDATED_AT_FIELD.to_string(), now);
        document.extend(fields);

        loaded.table.documents.push(document.clone());
        self.save(session, &mut loaded).await?;
        info!(actor = ?session.actor, "Inserted document {doc_id} into table {table_id}");

        let changes = loaded
            .table
            .unique_columns()
            .map(|c| {
                (
                    c.key.clone(),
                    vec![IndexChange::insert(&doc_id, document.get(&c.key))],
                )
            })
            .collect_vec();
        self.sync_indexes(session, &mut loaded, changes).await;

        Ok(document)
    }

    /// Merge `patch` over a document's user fields. `$id` and `$createdAt`
    /// are kept and `$updatedAt` moves strictly forward. A field set to null
    /// or empty in the patch is cleared, unless the column is required.
    pub async fn update_document(
        &self,
        session: &Session,
        table_id: &str,
        doc_id: &str,
        patch: &Document,
    ) -> TableResult<Document> {
        let mut loaded = self.load(session, table_id, true).await?;
        let position = loaded
            .table
            .position(doc_id)
            .ok_or_else(|| TableError::DocumentNotFound {
                id: doc_id.to_string(),
            })?;
        let existing = loaded.table.documents[position].clone();

        let mut merged = user_fields(&existing);
        merged.extend(
            patch
                .iter()
                .filter(|(key, _)| !is_system_field(key))
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        let fields = self.validator(&loaded.table)?.validate(&merged)?;
        self.ensure_unique(session, &loaded, &fields, Some(doc_id), Some(&existing))
            .await?;

        let mut document = Document::new();
        for key in [ID_FIELD, CREATED_AT_FIELD] {
            if let Some(value) = existing.get(key) {
                document.insert(key.to_string(), value.clone());
            }
        }
        document.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(format_timestamp(next_timestamp(
                existing.get(UPDATED_AT_FIELD),
            ))),
        );
        document.extend(fields);

        loaded.table.documents[position] = document.clone();
        self.save(session, &mut loaded).await?;
        info!(actor = ?session.actor, "Updated document {doc_id} in table {table_id}");

        let changes = loaded
            .table
            .unique_columns()
            .filter(|c| {
                existing.get(&c.key).and_then(index_key) != document.get(&c.key).and_then(index_key)
            })
            .map(|c| {
                (
                    c.key.clone(),
                    vec![IndexChange {
                        doc_id: doc_id.to_string(),
                        old: existing.get(&c.key).cloned(),
                        new: document.get(&c.key).cloned(),
                    }],
                )
            })
            .collect_vec();
        self.sync_indexes(session, &mut loaded, changes).await;

        Ok(document)
    }

    pub async fn delete_document(
        &self,
        session: &Session,
        table_id: &str,
        doc_id: &str,
    ) -> TableResult<()> {
        match self
            .bulk_delete(session, table_id, &[doc_id.to_string()])
            .await?
        {
            0 => Err(TableError::DocumentNotFound {
                id: doc_id.to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Delete every listed document that exists. Returns how many were
    /// deleted; unknown ids are ignored.
    pub async fn bulk_delete(
        &self,
        session: &Session,
        table_id: &str,
        doc_ids: &[DocumentId],
    ) -> TableResult<usize> {
        let mut loaded = self.load(session, table_id, true).await?;
        let doc_ids: HashSet<&str> = doc_ids.iter().map(String::as_str).collect();

        let (removed, kept): (Vec<Document>, Vec<Document>) =
            std::mem::take(&mut loaded.table.documents)
                .into_iter()
                .partition(|d| document_id(d).map_or(false, |id| doc_ids.contains(id)));
        if removed.is_empty() {
            return Ok(0);
        }

        loaded.table.documents = kept;
        self.save(session, &mut loaded).await?;
        info!(
            actor = ?session.actor,
            "Deleted {} documents from table {table_id}",
            removed.len()
        );

        if self.options.retract_on_delete {
            let changes = loaded
                .table
                .unique_columns()
                .map(|c| {
                    let retractions = removed
                        .iter()
                        .filter_map(|d| {
                            document_id(d).map(|id| IndexChange::retract(id, d.get(&c.key)))
                        })
                        .collect_vec();
                    (c.key.clone(), retractions)
                })
                .collect_vec();
            self.sync_indexes(session, &mut loaded, changes).await;
        }

        Ok(removed.len())
    }

    /// Coerce a column default through the column's own rules.
    fn coerce_default(column: &ColumnDefinition, default: &Value) -> TableResult<Option<Value>> {
        let optional = ColumnDefinition {
            required: false,
            ..column.clone()
        };
        let mut payload = Document::new();
        payload.insert(column.key.clone(), default.clone());

        let coerced = compile(std::slice::from_ref(&optional))?.validate(&payload)?;
        Ok(coerced.get(&column.key).cloned())
    }

    /// Append a column. A `default` is written into every existing document
    /// lacking the field; a unique column gets its index built right away.
    pub async fn add_column(
        &self,
        session: &Session,
        table_id: &str,
        column: ColumnDefinition,
    ) -> TableResult<ColumnDefinition> {
        let mut loaded = self.load(session, table_id, true).await?;
        check_new_columns(&loaded.table.schema, std::slice::from_ref(&column))
            .map_err(column_error)?;
        let mut column = ColumnDefinition {
            index_file_id: None,
            ..column
        };

        if let Some(default) = &column.default {
            if let Some(value) = Self::coerce_default(&column, default)? {
                for document in loaded.table.documents.iter_mut() {
                    if document.get(&column.key).map_or(true, Value::is_null) {
                        document.insert(column.key.clone(), value.clone());
                    }
                }
            }
        }

        if column.unique {
            if let Some(value) = first_duplicate(&loaded.table.documents, &column.key) {
                return Err(TableError::UniqueConstraint {
                    field: column.key.clone(),
                    value,
                });
            }
            let index_id = self
                .indexes
                .rebuild(session, table_id, &column.key, &loaded.table.documents, None)
                .await?;
            column.index_file_id = Some(index_id);
        }

        loaded.table.schema.push(column.clone());
        self.save(session, &mut loaded).await?;
        info!("Added column {:?} to table {table_id}", column.key);

        Ok(column)
    }

    /// Remove a column, its values from every document and its index.
    pub async fn drop_column(
        &self,
        session: &Session,
        table_id: &str,
        key: &str,
    ) -> TableResult<()> {
        if is_system_field(key) {
            return Err(TableError::SystemColumn {
                key: key.to_string(),
            });
        }

        let mut loaded = self.load(session, table_id, true).await?;
        let position = loaded
            .table
            .schema
            .iter()
            .position(|c| c.key == key)
            .ok_or_else(|| TableError::ColumnNotFound {
                key: key.to_string(),
            })?;
        let column = loaded.table.schema.remove(position);
        for document in loaded.table.documents.iter_mut() {
            document.remove(key);
        }

        self.save(session, &mut loaded).await?;
        info!("Dropped column {key:?} from table {table_id}");

        if column.unique || column.index_file_id.is_some() {
            self.indexes
                .delete(session, table_id, key, column.index_file_id.as_deref())
                .await;
        }
        Ok(())
    }

    /// Mark or unmark a column as unique. Marking requires the existing
    /// values to be distinct and (re)builds the index; unmarking drops it.
    pub async fn set_column_unique(
        &self,
        session: &Session,
        table_id: &str,
        key: &str,
        unique: bool,
    ) -> TableResult<ColumnDefinition> {
        if is_system_field(key) {
            return Err(TableError::SystemColumn {
                key: key.to_string(),
            });
        }

        let mut loaded = self.load(session, table_id, true).await?;
        let previous = loaded
            .table
            .column(key)
            .map(|c| c.index_file_id.clone())
            .ok_or_else(|| TableError::ColumnNotFound {
                key: key.to_string(),
            })?;

        let index_id = if unique {
            if let Some(value) = first_duplicate(&loaded.table.documents, key) {
                return Err(TableError::UniqueConstraint {
                    field: key.to_string(),
                    value,
                });
            }
            Some(
                self.indexes
                    .rebuild(
                        session,
                        table_id,
                        key,
                        &loaded.table.documents,
                        previous.as_deref(),
                    )
                    .await?,
            )
        } else {
            None
        };

        let column = loaded
            .table
            .column_mut(key)
            .ok_or_else(|| TableError::ColumnNotFound {
                key: key.to_string(),
            })?;
        column.unique = unique;
        column.index_file_id = index_id;
        let column = column.clone();

        self.save(session, &mut loaded).await?;
        info!("Set unique={unique} on column {key:?} of table {table_id}");

        if !unique {
            self.indexes
                .delete(session, table_id, key, previous.as_deref())
                .await;
        }
        Ok(column)
    }

    /// Recompute a unique column's index from the table's documents.
    pub async fn rebuild_index(
        &self,
        session: &Session,
        table_id: &str,
        key: &str,
    ) -> TableResult<BlobId> {
        let mut loaded = self.load(session, table_id, true).await?;
        let column = loaded
            .table
            .column(key)
            .ok_or_else(|| TableError::ColumnNotFound {
                key: key.to_string(),
            })?;
        if !column.unique {
            return Err(TableError::ColumnNotUnique {
                key: key.to_string(),
            });
        }

        let index_id = self
            .indexes
            .rebuild(
                session,
                table_id,
                key,
                &loaded.table.documents,
                column.index_file_id.as_deref(),
            )
            .await?;

        if let Some(column) = loaded.table.column_mut(key) {
            column.index_file_id = Some(index_id.clone());
        }
        self.save(session, &mut loaded).await?;
        Ok(index_id)
    }

    /// Delete a table blob, then its indexes on a best-effort basis.
    pub async fn delete_table(&self, session: &Session, table_id: &str) -> TableResult<()> {
        let loaded = self.load(session, table_id, true).await?;
        session
            .write("delete", self.store.delete(table_id))
            .await
            .map_err(not_found_as_table(table_id))?;
        info!(actor = ?session.actor, "Deleted table {:?} ({table_id})", loaded.table.name);

        for column in loaded
            .table
            .schema
            .iter()
            .filter(|c| c.unique || c.index_file_id.is_some())
        {
            self.indexes
                .delete(session, table_id, &column.key, column.index_file_id.as_deref())
                .await;
        }
        Ok(())
    }
}
