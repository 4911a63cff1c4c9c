use crate::error::Result;
use crate::model::EntityTypeDescriptor;
use crate::predicate::QuerySpec;
use crate::record::{EntityRecord, ObjectId};
use crate::schema::DatasetSchema;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Lazily produced records of a query.
///
/// A backend failure part way through is delivered as a final `Err` item.
pub type RecordStream = BoxStream<'static, Result<EntityRecord>>;

/// Supplies dataset schema documents
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Identifiers of every dataset that should be served
    async fn dataset_ids(&self) -> Result<Vec<String>>;

    /// Load one dataset document
    async fn load(&self, dataset_id: &str) -> Result<DatasetSchema>;
}

/// Executes backend-agnostic queries.
///
/// Implementations translate the predicate tree, ordering and limits into
/// their own query language and must produce records lazily; dropping the
/// returned stream must stop any further reads.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, query: QuerySpec) -> Result<RecordStream>;
}

/// Alternative source for embedded records, e.g. another service.
///
/// Receives the distinct referenced ids and returns whatever it can find;
/// missing ids are not an error.
#[async_trait]
pub trait ExternalFetcher: Send + Sync {
    async fn fetch(
        &self,
        table: &Arc<EntityTypeDescriptor>,
        ids: &[ObjectId],
    ) -> Result<Vec<EntityRecord>>;
}
