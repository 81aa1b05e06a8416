pub mod local;

use local::LocalConfig;

use object_store::{memory::InMemory, ObjectStore};
use serde::Deserialize;
use std::sync::Arc;

/// Backends a blob store can be built on top of.
#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    Local(LocalConfig),
    Memory,
}

impl ObjectStoreConfig {
    pub fn build_object_store(&self) -> Result<Arc<dyn ObjectStore>, object_store::Error> {
        match self {
            ObjectStoreConfig::Memory => Ok(Arc::new(InMemory::new())),
            ObjectStoreConfig::Local(local_config) => local_config.build_local_storage(),
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, ObjectStoreConfig::Memory)
    }
}
