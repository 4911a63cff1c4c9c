//! In-memory implementation of the dso-query backend traits
//!
//! Rows are plain JSON objects held per table. Queries are answered by
//! evaluating the predicate tree directly, including relation traversal by
//! joining on the related table's rows. Records are handed out lazily, so
//! consumers that stop early also stop the reads, which [`BackendStats`]
//! makes observable.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dso_query::{QueryConfig, QueryEngine, SchemaRegistry, TableKey};
//! use dso_query_memory::{MemoryBackend, MemorySchemaSource};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> dso_query::Result<()> {
//! let source = Arc::new(MemorySchemaSource::new());
//! source
//!     .insert(json!({
//!         "id": "bag",
//!         "tables": [{"id": "panden", "schema": {"properties": {"id": {"type": "integer"}}}}]
//!     }))
//!     .await?;
//!
//! let registry = SchemaRegistry::load(source).await?;
//! let backend = Arc::new(MemoryBackend::new());
//! let panden = registry.current().await.model_for(&TableKey::new("bag", "panden"))?.clone();
//! backend.insert_table(panden, vec![json!({"id": 1}), json!({"id": 2})]).await?;
//!
//! let engine = QueryEngine::new(registry, backend, QueryConfig::default());
//! # Ok(())
//! # }
//! ```

mod eval;

use async_stream::stream;
use async_trait::async_trait;
use dso_query::{
    DataRow, DatasetSchema, DistinctOn, EntityRecord, EntityTypeDescriptor, QueryError,
    QueryExecutor, QuerySpec, RecordStream, Result, SchemaSource, SortKey, TableKey,
};
use eval::{order_values, Evaluator};
use futures::StreamExt;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Schema documents kept in memory, keyed by dataset id
#[derive(Default)]
pub struct MemorySchemaSource {
    documents: RwLock<BTreeMap<String, Value>>,
}

impl MemorySchemaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a dataset document; it is picked up on the next reload
    pub async fn insert(&self, document: Value) -> Result<()> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Serialization("dataset document has no 'id'".to_string()))?
            .to_string();
        debug!("Storing schema document for dataset {}", id);
        self.documents.write().await.insert(id, document);
        Ok(())
    }

    pub async fn remove(&self, dataset_id: &str) -> bool {
        self.documents.write().await.remove(dataset_id).is_some()
    }
}

#[async_trait]
impl SchemaSource for MemorySchemaSource {
    async fn dataset_ids(&self) -> Result<Vec<String>> {
        Ok(self.documents.read().await.keys().cloned().collect())
    }

    async fn load(&self, dataset_id: &str) -> Result<DatasetSchema> {
        let document = self
            .documents
            .read()
            .await
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| QueryError::not_found(format!("dataset {} does not exist", dataset_id)))?;
        DatasetSchema::from_value(document)
    }
}

/// Rows of one table together with the model they were stored under
#[derive(Clone)]
pub(crate) struct MemoryTable {
    pub(crate) descriptor: Arc<EntityTypeDescriptor>,
    pub(crate) rows: Arc<Vec<Value>>,
}

/// Counters of the work done by a [`MemoryBackend`]
#[derive(Debug, Default)]
pub struct BackendStats {
    executions: AtomicUsize,
    rows_pulled: AtomicUsize,
    queries: Mutex<Vec<QuerySpec>>,
}

impl BackendStats {
    /// Number of executed queries
    pub fn executions(&self) -> usize {
        self.executions.load(AtomicOrdering::SeqCst)
    }

    /// Number of records consumers have pulled from result streams
    pub fn rows_pulled(&self) -> usize {
        self.rows_pulled.load(AtomicOrdering::SeqCst)
    }

    /// Every executed query, oldest first
    pub fn queries(&self) -> Vec<QuerySpec> {
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Executed queries against `table`
    pub fn queries_for(&self, table: &TableKey) -> Vec<QuerySpec> {
        self.queries()
            .into_iter()
            .filter(|q| &q.table.key == table)
            .collect()
    }

    pub fn reset(&self) {
        self.executions.store(0, AtomicOrdering::SeqCst);
        self.rows_pulled.store(0, AtomicOrdering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }

    fn record(&self, query: &QuerySpec) {
        self.executions.fetch_add(1, AtomicOrdering::SeqCst);
        self.queries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(query.clone());
    }
}

/// Query executor over JSON rows held in memory
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<TableKey, MemoryTable>>,
    stats: Arc<BackendStats>,
    fail_after: Mutex<Option<usize>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the rows of a table
    pub async fn insert_table(
        &self,
        descriptor: Arc<EntityTypeDescriptor>,
        rows: Vec<Value>,
    ) -> Result<()> {
        if let Some(index) = rows.iter().position(|row| !row.is_object()) {
            return Err(QueryError::backend(format!(
                "row {} of {} is not a JSON object",
                index, descriptor.key
            )));
        }
        debug!("Storing {} rows for {}", rows.len(), descriptor.key);
        let key = descriptor.key.clone();
        let table = MemoryTable {
            descriptor,
            rows: Arc::new(rows),
        };
        self.tables.write().await.insert(key, table);
        Ok(())
    }

    pub fn stats(&self) -> Arc<BackendStats> {
        self.stats.clone()
    }

    /// Make result streams fail after handing out `rows` records
    pub fn fail_after(&self, rows: Option<usize>) {
        *self
            .fail_after
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = rows;
    }

    fn select(&self, query: &QuerySpec, tables: &HashMap<TableKey, MemoryTable>) -> Result<Vec<Value>> {
        let table = tables.get(&query.table.key).ok_or_else(|| {
            QueryError::backend(format!("no data stored for table {}", query.table.key))
        })?;
        let evaluator = Evaluator::new(tables);

        let mut rows = Vec::new();
        for row in table.rows.iter() {
            if evaluator.matches(&query.predicate, row, table)? {
                rows.push(row);
            }
        }

        if let Some(distinct) = &query.distinct_on {
            rows = distinct_rows(&evaluator, table, rows, distinct);
        }
        if !query.ordering.is_empty() {
            rows.sort_by(|a, b| compare_rows(&evaluator, table, &query.ordering, a, b));
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueryExecutor for MemoryBackend {
    async fn execute(&self, query: QuerySpec) -> Result<RecordStream> {
        self.stats.record(&query);
        let tables = self.tables.read().await.clone();
        let selected = self.select(&query, &tables)?;
        debug!(
            "Query on {} selected {} rows (offset {}, limit {:?})",
            query.table.key,
            selected.len(),
            query.offset,
            query.limit
        );

        let descriptor = query.table.clone();
        let stats = self.stats.clone();
        let fail_after = *self
            .fail_after
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let records = stream! {
            for (index, row) in selected.into_iter().enumerate() {
                if fail_after.is_some_and(|limit| index >= limit) {
                    error!("Simulated failure reading {} after {} rows", descriptor.key, index);
                    yield Err(QueryError::backend("connection to storage lost"));
                    break;
                }
                stats.rows_pulled.fetch_add(1, AtomicOrdering::SeqCst);
                yield Ok(into_record(&descriptor, row));
            }
        };
        Ok(records.boxed())
    }
}

fn into_record(descriptor: &Arc<EntityTypeDescriptor>, row: Value) -> EntityRecord {
    let row: DataRow = match row {
        Value::Object(map) => map.into_iter().collect(),
        _ => DataRow::new(),
    };
    EntityRecord::from_row(descriptor.clone(), row)
}

/// First row per distinct key, in the order given by `distinct.order`
fn distinct_rows<'r>(
    evaluator: &Evaluator<'_>,
    table: &MemoryTable,
    mut rows: Vec<&'r Value>,
    distinct: &DistinctOn,
) -> Vec<&'r Value> {
    rows.sort_by(|a, b| compare_rows(evaluator, table, &distinct.order, a, b));
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| {
            let key: Vec<Value> = distinct
                .keys
                .iter()
                .map(|path| first_value(evaluator, table, row, path))
                .collect();
            seen.insert(Value::Array(key).to_string())
        })
        .collect()
}

fn compare_rows(
    evaluator: &Evaluator<'_>,
    table: &MemoryTable,
    ordering: &[SortKey],
    a: &Value,
    b: &Value,
) -> Ordering {
    for key in ordering {
        let left = first_value(evaluator, table, a, &key.path);
        let right = first_value(evaluator, table, b, &key.path);
        let ordering = order_values(&left, &right);
        let ordering = if key.descending {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn first_value(
    evaluator: &Evaluator<'_>,
    table: &MemoryTable,
    row: &Value,
    path: &dso_query::FieldPath,
) -> Value {
    evaluator
        .values(row, table, path)
        .into_iter()
        .next()
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dso_query::{EntityModelFactory, FieldPath, Predicate, QueryBuilder};
    use futures::TryStreamExt;
    use serde_json::json;

    fn descriptor() -> Arc<EntityTypeDescriptor> {
        let dataset = DatasetSchema::from_value(json!({
            "id": "d",
            "tables": [{
                "id": "t",
                "schema": {"properties": {"id": {"type": "integer"}, "naam": {"type": "string"}}}
            }]
        }))
        .unwrap();
        Arc::new(EntityModelFactory::build(&dataset.tables[0], &dataset).unwrap())
    }

    #[tokio::test]
    async fn test_filter_sort_slice() {
        let table = descriptor();
        let backend = MemoryBackend::new();
        backend
            .insert_table(
                table.clone(),
                (1..=5).map(|i| json!({"id": i, "naam": format!("n{}", i % 2)})).collect(),
            )
            .await
            .unwrap();

        let query = QueryBuilder::new(table)
            .filter(Predicate::eq(FieldPath::field("naam"), json!("n1")))
            .order_by([SortKey::desc(FieldPath::field("id"))])
            .offset(1)
            .limit(5)
            .build();
        let records: Vec<EntityRecord> = backend.execute(query).await.unwrap().try_collect().await.unwrap();
        let ids: Vec<Value> = records.iter().map(|r| r.get("id").cloned().unwrap()).collect();
        assert_eq!(ids, vec![json!(3), json!(1)]);
        assert_eq!(backend.stats().executions(), 1);
    }

    #[tokio::test]
    async fn test_failure_is_terminal_item() {
        let table = descriptor();
        let backend = MemoryBackend::new();
        backend
            .insert_table(table.clone(), (1..=5).map(|i| json!({"id": i})).collect())
            .await
            .unwrap();
        backend.fail_after(Some(2));

        let items: Vec<Result<EntityRecord>> = backend
            .execute(QueryBuilder::new(table).build())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok() && items[1].is_ok());
        assert!(matches!(items[2], Err(QueryError::Backend(_))));
    }

    #[tokio::test]
    async fn test_rejects_non_object_rows() {
        let backend = MemoryBackend::new();
        let err = backend
            .insert_table(descriptor(), vec![json!([1, 2])])
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Backend(_)));
    }
}
