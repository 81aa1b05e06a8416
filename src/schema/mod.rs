//! Column definitions of a table and the validator compiled from them.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::data_types::{
    is_system_field, BlobId, TableId, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};

pub mod cache;
pub mod validate;

pub use cache::ValidatorCache;
pub use validate::{compile, ErrorCode, FieldError, ValidationErrors, Validator};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("Column key can't be empty")]
    EmptyKey,

    #[error("Column {key:?} uses the reserved `$` prefix")]
    ReservedKey { key: String },

    #[error("Column {key:?} is defined more than once")]
    DuplicateKey { key: String },

    #[error("Invalid pattern for column {key:?}: {reason}")]
    InvalidPattern { key: String, reason: String },

    #[error("Failed serializing schema: {reason}")]
    Serialization { reason: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Integer,
    Boolean,
    Datetime,
    Relation,
    Storage,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub email: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub url: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub allowed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Replaces the default message of every rule violation on the column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    pub key: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub array: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default)]
    pub unique: bool,
    /// Id of this column's unique index blob. A plain pointer: the index
    /// manager owns the blob, the schema only remembers where it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_file_id: Option<BlobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_table_id: Option<TableId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRules>,
}

impl ColumnDefinition {
    pub fn new(key: &str, column_type: ColumnType) -> Self {
        Self {
            key: key.to_string(),
            column_type,
            required: false,
            array: false,
            default: None,
            unique: false,
            index_file_id: None,
            relation_table_id: None,
            validation: None,
        }
    }

    pub fn required(self) -> Self {
        Self {
            required: true,
            ..self
        }
    }

    pub fn array(self) -> Self {
        Self {
            array: true,
            ..self
        }
    }

    pub fn unique(self) -> Self {
        Self {
            unique: true,
            ..self
        }
    }

    pub fn with_default(self, default: Value) -> Self {
        Self {
            default: Some(default),
            ..self
        }
    }

    pub fn with_validation(self, validation: ValidationRules) -> Self {
        Self {
            validation: Some(validation),
            ..self
        }
    }

    pub fn is_system(&self) -> bool {
        is_system_field(&self.key)
    }
}

/// The columns every table starts with.
pub fn system_columns() -> Vec<ColumnDefinition> {
    vec![
        ColumnDefinition::new(ID_FIELD, ColumnType::String).required(),
        ColumnDefinition::new(CREATED_AT_FIELD, ColumnType::Datetime).required(),
        ColumnDefinition::new(UPDATED_AT_FIELD, ColumnType::Datetime).required(),
    ]
}

/// Check a user-supplied column definition before it enters a schema.
pub fn check_column(column: &ColumnDefinition) -> Result<(), SchemaError> {
    if column.key.trim().is_empty() {
        return Err(SchemaError::EmptyKey);
    }
    if column.is_system() {
        return Err(SchemaError::ReservedKey {
            key: column.key.clone(),
        });
    }
    if column.column_type == ColumnType::Relation && column.relation_table_id.is_none() {
        warn!(
            "Relation column {:?} doesn't name the table it points to",
            column.key
        );
    }
    Ok(())
}

/// Check a list of user-supplied columns, including duplicates among them
/// and against `existing`.
pub fn check_new_columns(
    existing: &[ColumnDefinition],
    columns: &[ColumnDefinition],
) -> Result<(), SchemaError> {
    let mut seen: HashSet<&str> = existing.iter().map(|c| c.key.as_str()).collect();
    for column in columns {
        check_column(column)?;
        if !seen.insert(column.key.as_str()) {
            return Err(SchemaError::DuplicateKey {
                key: column.key.clone(),
            });
        }
    }
    // Surface bad regexes now rather than on the first insert
    compile(columns)?;
    Ok(())
}
