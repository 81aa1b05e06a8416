//! Wiring shared by frontends: one repository plus the session requests start
//! from.

use std::sync::Arc;

use crate::data_types::TableId;
use crate::repository::{TableError, TableRepository, TableResult};
use crate::session::Session;

#[derive(Debug, Clone)]
pub struct BlobtableContext {
    repository: Arc<TableRepository>,
    session: Session,
}

impl BlobtableContext {
    pub fn new(repository: Arc<TableRepository>, session: Session) -> Self {
        Self {
            repository,
            session,
        }
    }

    pub fn repository(&self) -> &TableRepository {
        &self.repository
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Copy of this context acting on behalf of `actor`.
    pub fn with_actor(&self, actor: &str) -> Self {
        Self {
            repository: self.repository.clone(),
            session: self.session.clone().with_actor(actor),
        }
    }

    /// Find a table by id or, failing that, by name.
    pub async fn resolve_table(&self, name_or_id: &str) -> TableResult<TableId> {
        let tables = self.repository.list_tables(&self.session).await?;

        tables
            .iter()
            .find(|t| t.id == name_or_id)
            .or_else(|| tables.iter().find(|t| t.name == name_or_id))
            .map(|t| t.id.clone())
            .ok_or_else(|| TableError::TableNotFound {
                id: name_or_id.to_string(),
            })
    }
}
