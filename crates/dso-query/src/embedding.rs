//! Embedding of related records ("expand").
//!
//! Referenced ids are collected from the primary records, then each
//! expanded relation is fetched with a single query for the distinct ids.
//! In list mode the primary records are already materialized. In streaming
//! mode an [`ObservableStream`] records the ids while the page is consumed
//! and the [`EmbeddedResultSet`] fetches afterwards.

use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::model::{EntityTypeDescriptor, FieldDescriptor, ForeignKey, ModelLookup, RelationKey, ScalarType};
use crate::params::QueryParams;
use crate::predicate::{FieldPath, Predicate, QueryBuilder};
use crate::record::{EntityRecord, ObjectId};
use crate::schema::TableKey;
use crate::scopes::{Access, FilterScope};
use crate::temporal::TemporalTableQuery;
use crate::traits::{ExternalFetcher, QueryExecutor};
use crate::values::{parse_bool, parse_scalar};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tracing::debug;

/// Which relations a request wants embedded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandRequest {
    Nothing,
    /// `_expand=true`: every relation the caller may see
    All,
    /// Explicitly named relations
    Fields(Vec<String>),
}

impl ExpandRequest {
    pub fn from_params(params: &QueryParams, config: &QueryConfig) -> Result<Self> {
        let names = &config.params;
        if let Some(raw) = params.get(&names.expand_scope) {
            return Self::field_list(&names.expand_scope, raw);
        }
        match params.get(&names.expand) {
            None => Ok(ExpandRequest::Nothing),
            Some(raw) => match parse_bool(raw.trim()) {
                Some(true) => Ok(ExpandRequest::All),
                Some(false) => Ok(ExpandRequest::Nothing),
                None => Self::field_list(&names.expand, raw),
            },
        }
    }

    fn field_list(param: &str, raw: &str) -> Result<Self> {
        let mut fields: Vec<String> = Vec::new();
        for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !fields.iter().any(|f| f == name) {
                fields.push(name.to_string());
            }
        }
        if fields.is_empty() {
            return Err(QueryError::validation(param, "no fields to expand"));
        }
        Ok(ExpandRequest::Fields(fields))
    }
}

/// How the records of one embedded relation are obtained
#[derive(Clone)]
pub enum FetchStrategy {
    /// Query the related table through the executor
    ById,
    External(Arc<dyn ExternalFetcher>),
}

impl fmt::Debug for FetchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchStrategy::ById => f.write_str("ById"),
            FetchStrategy::External(_) => f.write_str("External"),
        }
    }
}

/// External fetchers keyed by (table, relation field)
pub type FetcherMap = HashMap<(TableKey, String), Arc<dyn ExternalFetcher>>;

/// A relation that will be embedded
#[derive(Debug, Clone)]
pub struct EmbeddedField {
    pub name: String,
    pub relation: ForeignKey,
    pub target: Arc<EntityTypeDescriptor>,
    pub strategy: FetchStrategy,
}

impl EmbeddedField {
    /// References carry the full primary key of the target, so no temporal
    /// resolution is needed
    fn references_exact_version(&self) -> bool {
        matches!(self.relation.key, RelationKey::Composite(_)) && !self.relation.loose
    }

    fn key_of(&self, record: &EntityRecord) -> Option<ObjectId> {
        if self.references_exact_version() {
            record.primary_key()
        } else {
            record.object_id()
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddedEntry {
    /// Position of the referencing record among the primary records
    pub source: usize,
    pub id: ObjectId,
    /// `None` when the referenced record does not exist
    pub record: Option<EntityRecord>,
}

/// Embedded records of one relation, in reference order
#[derive(Debug, Clone)]
pub struct EmbeddedGroup {
    pub field: String,
    pub table: TableKey,
    pub entries: Vec<EmbeddedEntry>,
}

impl EmbeddedGroup {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = Option<&EntityRecord>> {
        self.entries.iter().map(|e| e.record.as_ref())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries.iter().map(|e| &e.id)
    }

    /// Entries referenced by the primary record at `source`
    pub fn for_source(&self, source: usize) -> impl Iterator<Item = &EmbeddedEntry> {
        self.entries.iter().filter(move |e| e.source == source)
    }
}

/// Fetches the embedded relations of one request
pub struct EmbeddingResolver {
    executor: Arc<dyn QueryExecutor>,
    fields: Vec<EmbeddedField>,
    temporal: TemporalTableQuery,
    config: QueryConfig,
}

impl EmbeddingResolver {
    /// `temporal` is the temporal selection of the primary request; it is
    /// carried over to temporal related tables.
    pub fn new(
        executor: Arc<dyn QueryExecutor>,
        fields: Vec<EmbeddedField>,
        temporal: TemporalTableQuery,
        config: QueryConfig,
    ) -> Self {
        Self {
            executor,
            fields,
            temporal,
            config,
        }
    }

    pub fn fields(&self) -> &[EmbeddedField] {
        &self.fields
    }

    /// Select and authorize the relations to embed.
    ///
    /// With `_expand=true` relations the caller may not see are left out
    /// silently. A relation named explicitly must be accessible.
    pub fn resolve_fields(
        models: &dyn ModelLookup,
        table: &EntityTypeDescriptor,
        expand: &ExpandRequest,
        scopes: &FilterScope,
        fetchers: &FetcherMap,
    ) -> Result<Vec<EmbeddedField>> {
        match expand {
            ExpandRequest::Nothing => Ok(Vec::new()),
            ExpandRequest::All => Ok(table
                .relation_fields()
                .filter_map(|field| match embeddable(models, table, field, scopes, fetchers) {
                    Ok(embedded) => Some(embedded),
                    Err(e) => {
                        debug!("Not expanding {}.{}: {}", table.key, field.name, e);
                        None
                    }
                })
                .collect()),
            ExpandRequest::Fields(names) => names
                .iter()
                .map(|name| {
                    let field = table.field(name).ok_or_else(|| {
                        QueryError::validation(
                            name.as_str(),
                            format!("{} has no field '{}' to expand", table.key, name),
                        )
                    })?;
                    embeddable(models, table, field, scopes, fetchers)
                })
                .collect(),
        }
    }

    /// Embed the relations of records that are already materialized
    pub async fn embed_list(&self, records: &[EntityRecord]) -> Result<Vec<EmbeddedGroup>> {
        let mut groups = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let references = records
                .iter()
                .enumerate()
                .flat_map(|(source, record)| {
                    record
                        .references(&field.name)
                        .into_iter()
                        .map(move |id| (source, id))
                })
                .collect();
            groups.push(self.resolve_group(field, references).await?);
        }
        Ok(groups)
    }

    async fn resolve_group(
        &self,
        field: &EmbeddedField,
        references: Vec<(usize, ObjectId)>,
    ) -> Result<EmbeddedGroup> {
        let mut seen = HashSet::new();
        let distinct: Vec<ObjectId> = references
            .iter()
            .filter(|(_, id)| seen.insert(id.clone()))
            .map(|(_, id)| id.clone())
            .collect();

        let found = if distinct.is_empty() {
            HashMap::new()
        } else {
            self.fetch(field, &distinct).await?
        };

        let entries = references
            .into_iter()
            .map(|(source, id)| EmbeddedEntry {
                source,
                record: found.get(&id).cloned(),
                id,
            })
            .collect();
        Ok(EmbeddedGroup {
            field: field.name.clone(),
            table: field.target.key.clone(),
            entries,
        })
    }

    async fn fetch(
        &self,
        field: &EmbeddedField,
        ids: &[ObjectId],
    ) -> Result<HashMap<ObjectId, EntityRecord>> {
        let mut found = HashMap::with_capacity(ids.len());
        // an unchecked config may carry 0; fall back to one id per query
        for batch in ids.chunks(self.config.max_embedded_ids.max(1)) {
            let records = match &field.strategy {
                FetchStrategy::ById => self.fetch_by_id(field, batch).await?,
                FetchStrategy::External(fetcher) => fetcher.fetch(&field.target, batch).await?,
            };
            for record in records {
                if let Some(key) = field.key_of(&record) {
                    found.entry(key).or_insert(record);
                }
            }
        }
        debug!(
            "Embedded {}: {} of {} referenced records found",
            field.name,
            found.len(),
            ids.len()
        );
        Ok(found)
    }

    async fn fetch_by_id(&self, field: &EmbeddedField, ids: &[ObjectId]) -> Result<Vec<EntityRecord>> {
        let target = &field.target;
        let predicate = if field.references_exact_version() {
            let alternatives: Vec<Predicate> = ids
                .iter()
                .filter_map(|id| primary_key_predicate(target, id))
                .collect();
            if alternatives.is_empty() {
                return Ok(Vec::new());
            }
            Predicate::Or(alternatives)
        } else {
            let scalar = scalar_of(target, &target.identifier);
            let values: Vec<Value> = ids
                .iter()
                .filter_map(|id| parse_scalar(scalar, id.as_str()).ok())
                .collect();
            if values.is_empty() {
                return Ok(Vec::new());
            }
            Predicate::In {
                path: FieldPath::field(&target.identifier),
                values,
            }
        };

        let mut builder = QueryBuilder::new(target.clone()).filter(predicate);
        if !field.references_exact_version() {
            builder = self
                .temporal
                .for_related(target, &self.config)
                .filter_query(builder)?;
        }
        let records = self.executor.execute(builder.build()).await?;
        records.try_collect().await
    }
}

fn embeddable(
    models: &dyn ModelLookup,
    table: &EntityTypeDescriptor,
    field: &FieldDescriptor,
    scopes: &FilterScope,
    fetchers: &FetcherMap,
) -> Result<EmbeddedField> {
    let relation = field.storage.relation().ok_or_else(|| {
        QueryError::validation(
            field.name.as_str(),
            format!("'{}' is not a relation and cannot be expanded", field.name),
        )
    })?;
    if field.auth.evaluate(scopes) == Access::Denied {
        return Err(QueryError::permission_denied(
            field.name.as_str(),
            format!("expanding requires scope {}", field.auth),
        ));
    }
    let target = models.model(&relation.target).ok_or_else(|| {
        QueryError::validation(
            field.name.as_str(),
            format!("related table {} is not available", relation.target),
        )
    })?;
    for requirement in [&target.dataset_auth, &target.table_auth] {
        if requirement.evaluate(scopes) == Access::Denied {
            return Err(QueryError::permission_denied(
                field.name.as_str(),
                format!("related table {} requires scope {}", target.key, requirement),
            ));
        }
    }

    let strategy = fetchers
        .get(&(table.key.clone(), field.name.clone()))
        .map(|fetcher| FetchStrategy::External(fetcher.clone()))
        .unwrap_or(FetchStrategy::ById);
    Ok(EmbeddedField {
        name: field.name.clone(),
        relation: relation.clone(),
        target: target.clone(),
        strategy,
    })
}

fn scalar_of(table: &EntityTypeDescriptor, field: &str) -> ScalarType {
    table
        .field(field)
        .and_then(|f| f.storage.scalar())
        .unwrap_or(ScalarType::Text)
}

/// Match on every primary key component of `id` (`"identifier.version"`)
fn primary_key_predicate(table: &EntityTypeDescriptor, id: &ObjectId) -> Option<Predicate> {
    let count = table.primary_key.len();
    let mut parts: Vec<&str> = id.as_str().rsplitn(count, '.').collect();
    if parts.len() != count {
        return None;
    }
    parts.reverse();
    let mut predicates = Vec::with_capacity(count);
    for (name, raw) in table.primary_key.iter().zip(parts) {
        let value = parse_scalar(scalar_of(table, name), raw).ok()?;
        predicates.push(Predicate::eq(FieldPath::field(name), value));
    }
    Some(Predicate::and(predicates))
}

/// Receives every item passing through an [`ObservableStream`]
pub trait StreamObserver<T> {
    fn observe(&mut self, item: &T);
}

impl<T, F> StreamObserver<T> for F
where
    F: FnMut(&T),
{
    fn observe(&mut self, item: &T) {
        self(item)
    }
}

/// Stream decorator that shows each item to an observer before passing it on
pub struct ObservableStream<S, O> {
    inner: S,
    observer: O,
}

impl<S, O> ObservableStream<S, O> {
    pub fn new(inner: S, observer: O) -> Self {
        Self { inner, observer }
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }
}

impl<S, O> Stream for ObservableStream<S, O>
where
    S: Stream + Unpin,
    O: StreamObserver<S::Item> + Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let polled = this.inner.poll_next_unpin(cx);
        if let Poll::Ready(Some(item)) = &polled {
            this.observer.observe(item);
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[derive(Debug, Default)]
struct Collected {
    observed: usize,
    references: HashMap<String, Vec<(usize, ObjectId)>>,
}

/// Records the ids referenced by each observed record, per relation
#[derive(Debug, Clone)]
pub struct ReferenceCollector {
    fields: Arc<[String]>,
    state: Arc<Mutex<Collected>>,
}

impl ReferenceCollector {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            state: Arc::default(),
        }
    }

    pub fn for_fields(fields: &[EmbeddedField]) -> Self {
        Self::new(fields.iter().map(|f| f.name.clone()))
    }

    /// Number of records seen so far
    pub fn observed(&self) -> usize {
        self.lock().observed
    }

    /// (record position, id) pairs seen for `field`, in order
    pub fn references(&self, field: &str) -> Vec<(usize, ObjectId)> {
        self.lock().references.get(field).cloned().unwrap_or_default()
    }

    pub fn record(&self, record: &EntityRecord) {
        let mut state = self.lock();
        let source = state.observed;
        state.observed += 1;
        for field in self.fields.iter() {
            let ids = record.references(field);
            if !ids.is_empty() {
                state
                    .references
                    .entry(field.clone())
                    .or_default()
                    .extend(ids.into_iter().map(|id| (source, id)));
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Collected> {
        // the collected ids stay consistent even if an observer panicked
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl StreamObserver<EntityRecord> for ReferenceCollector {
    fn observe(&mut self, item: &EntityRecord) {
        self.record(item);
    }
}

impl StreamObserver<Result<EntityRecord>> for ReferenceCollector {
    fn observe(&mut self, item: &Result<EntityRecord>) {
        if let Ok(record) = item {
            self.record(record);
        }
    }
}

/// Embedded records of a streamed page, fetched once the page was consumed
pub struct EmbeddedResultSet {
    resolver: Arc<EmbeddingResolver>,
    collector: ReferenceCollector,
}

impl EmbeddedResultSet {
    pub fn new(resolver: Arc<EmbeddingResolver>, collector: ReferenceCollector) -> Self {
        Self { resolver, collector }
    }

    pub fn collector(&self) -> &ReferenceCollector {
        &self.collector
    }

    pub fn is_empty(&self) -> bool {
        self.resolver.fields.is_empty()
    }

    /// One group per embedded relation, each fetched when the stream reaches it.
    ///
    /// Uses the ids collected so far; poll it after the primary stream is done.
    pub fn stream(&self) -> BoxStream<'static, Result<EmbeddedGroup>> {
        let resolver = self.resolver.clone();
        let collector = self.collector.clone();
        let groups = stream! {
            for field in resolver.fields.iter() {
                let references = collector.references(&field.name);
                match resolver.resolve_group(field, references).await {
                    Ok(group) => yield Ok(group),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        groups.boxed()
    }

    pub async fn fetch(&self) -> Result<Vec<EmbeddedGroup>> {
        self.stream().try_collect().await
    }
}
