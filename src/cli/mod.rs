mod commands;

use std::io::Write;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::context::BlobtableContext;
use crate::data_types::Document;
use crate::query::Query;
use crate::repository::TableError;
use crate::schema::ColumnDefinition;

pub use commands::Command;

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error(transparent)]
    Table(#[from] TableError),

    #[error("Invalid {argument}: {reason}")]
    InvalidArgument { argument: String, reason: String },

    #[error("Failed writing output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed serializing output: {0}")]
    Output(#[from] serde_json::Error),
}

fn parse_json<T: DeserializeOwned>(argument: &str, raw: &str) -> Result<T, CliError> {
    serde_json::from_str(raw).map_err(|e| CliError::InvalidArgument {
        argument: argument.to_string(),
        reason: e.to_string(),
    })
}

fn parse_document(argument: &str, raw: &str) -> Result<Document, CliError> {
    match parse_json(argument, raw)? {
        Value::Object(map) => Ok(map),
        other => Err(CliError::InvalidArgument {
            argument: argument.to_string(),
            reason: format!("expected a JSON object, got {other}"),
        }),
    }
}

// Shell users shouldn't have to quote plain strings twice
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

pub struct BlobtableCli {
    ctx: BlobtableContext,
}

impl BlobtableCli {
    pub fn new(ctx: BlobtableContext) -> Self {
        BlobtableCli { ctx }
    }

    fn emit<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<(), CliError> {
        serde_json::to_writer(&mut *out, value)?;
        writeln!(out)?;
        Ok(())
    }

    // Execute a single command, writing each result as one JSON line
    pub async fn run<W: Write>(&self, command: Command, out: &mut W) -> Result<(), CliError> {
        debug!("Running {command:?}");
        let repository = self.ctx.repository();
        let session = self.ctx.session();

        match command {
            Command::CreateTable { name, columns } => {
                let columns: Vec<ColumnDefinition> = parse_json("columns", &columns)?;
                let id = repository.create(session, &name, columns).await?;
                Self::emit(out, &json!({ "id": id, "name": name }))
            }
            Command::ListTables => {
                for table in repository.list_tables(session).await? {
                    Self::emit(out, &table)?;
                }
                Ok(())
            }
            Command::Describe { table } => {
                let id = self.ctx.resolve_table(&table).await?;
                let blob = repository.get_table(session, &id).await?;
                Self::emit(
                    out,
                    &json!({
                        "id": id,
                        "name": blob.name,
                        "schema": blob.schema,
                        "documents": blob.documents.len(),
                    }),
                )
            }
            Command::Get { table, id } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                let document = repository.get_document(session, &table_id, &id).await?;
                Self::emit(out, &document)
            }
            Command::Insert { table, document } => {
                let payload = parse_document("document", &document)?;
                let table_id = self.ctx.resolve_table(&table).await?;
                let stored = repository.add_document(session, &table_id, &payload).await?;
                Self::emit(out, &stored)
            }
            Command::Validate { table, document } => {
                let payload = parse_document("document", &document)?;
                let table_id = self.ctx.resolve_table(&table).await?;
                let coerced = repository
                    .validate_document(session, &table_id, &payload)
                    .await?;
                Self::emit(out, &coerced)
            }
            Command::Update { table, id, patch } => {
                let patch = parse_document("patch", &patch)?;
                let table_id = self.ctx.resolve_table(&table).await?;
                let stored = repository
                    .update_document(session, &table_id, &id, &patch)
                    .await?;
                Self::emit(out, &stored)
            }
            Command::Delete { table, ids } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                let deleted = if let [id] = ids.as_slice() {
                    repository.delete_document(session, &table_id, id).await?;
                    1
                } else {
                    repository.bulk_delete(session, &table_id, &ids).await?
                };
                Self::emit(out, &json!({ "deleted": deleted }))
            }
            Command::CheckUnique {
                table,
                key,
                value,
                exclude,
            } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                let check = repository
                    .check_unique(
                        session,
                        &table_id,
                        &key,
                        &parse_value(&value),
                        exclude.as_deref(),
                    )
                    .await?;
                Self::emit(
                    out,
                    &json!({
                        "safe": check.safe,
                        "error": check.error,
                        "holders": check.holders,
                    }),
                )
            }
            Command::AddColumn { table, column } => {
                let column: ColumnDefinition = parse_json("column", &column)?;
                let table_id = self.ctx.resolve_table(&table).await?;
                let added = repository.add_column(session, &table_id, column).await?;
                Self::emit(out, &added)
            }
            Command::DropColumn { table, key } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                repository.drop_column(session, &table_id, &key).await?;
                Self::emit(out, &json!({ "dropped": key }))
            }
            Command::SetUnique {
                table,
                key,
                disable,
            } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                let column = repository
                    .set_column_unique(session, &table_id, &key, !disable)
                    .await?;
                Self::emit(out, &column)
            }
            Command::RebuildIndex { table, key } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                let index_id = repository.rebuild_index(session, &table_id, &key).await?;
                Self::emit(out, &json!({ "column": key, "indexFileId": index_id }))
            }
            Command::Query { table, query } => {
                let query: Query = parse_json("query", &query)?;
                let table_id = self.ctx.resolve_table(&table).await?;
                let result = repository.read(session, &table_id, &query).await?;
                Self::emit(out, &result)
            }
            Command::DropTable { table } => {
                let table_id = self.ctx.resolve_table(&table).await?;
                repository.delete_table(session, &table_id).await?;
                Self::emit(out, &json!({ "dropped": table_id }))
            }
        }
    }
}
