use std::sync::Arc;

use moka::sync::Cache;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{compile, ColumnDefinition, SchemaError, Validator};

pub const DEFAULT_VALIDATOR_CACHE_SIZE: u64 = 256;

/// Compiled validators keyed by a hash of the schema they were built from.
///
/// Index pointers are left out of the hash: they change whenever an index is
/// recreated but have no bearing on how a document is validated.
#[derive(Debug, Clone)]
pub struct ValidatorCache {
    cache: Cache<String, Arc<Validator>>,
}

impl Default for ValidatorCache {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATOR_CACHE_SIZE)
    }
}

impl ValidatorCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            cache: Cache::new(capacity),
        }
    }

    pub fn get_or_compile(
        &self,
        schema: &[ColumnDefinition],
    ) -> Result<Arc<Validator>, SchemaError> {
        let key = schema_hash(schema)?;
        if let Some(validator) = self.cache.get(&key) {
            return Ok(validator);
        }

        debug!("Compiling validator for schema {key}");
        let validator = Arc::new(compile(schema)?);
        self.cache.insert(key, validator.clone());
        Ok(validator)
    }
}

pub fn schema_hash(schema: &[ColumnDefinition]) -> Result<String, SchemaError> {
    let stripped: Vec<ColumnDefinition> = schema
        .iter()
        .cloned()
        .map(|column| ColumnDefinition {
            index_file_id: None,
            ..column
        })
        .collect();

    let serialized =
        serde_json::to_vec(&stripped).map_err(|e| SchemaError::Serialization {
            reason: e.to_string(),
        })?;

    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
