use object_store::{local::LocalFileSystem, ObjectStore};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

#[derive(Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct LocalConfig {
    pub data_dir: String,
}

impl LocalConfig {
    /// Build a filesystem-backed store rooted at `data_dir`, creating the
    /// directory if it doesn't exist yet.
    pub fn build_local_storage(&self) -> Result<Arc<dyn ObjectStore>, object_store::Error> {
        if self.data_dir.is_empty() {
            return Err(object_store::Error::Generic {
                store: "local",
                source: "Empty data directory".into(),
            });
        }

        std::fs::create_dir_all(&self.data_dir).map_err(|e| object_store::Error::Generic {
            store: "local",
            source: Box::new(e),
        })?;
        debug!("Using local blob storage at {}", self.data_dir);

        let store = LocalFileSystem::new_with_prefix(&self.data_dir)?;
        Ok(Arc::new(store))
    }
}
