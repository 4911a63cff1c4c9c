use crate::config::QueryConfig;
use crate::embedding::{
    EmbeddedGroup, EmbeddedResultSet, EmbeddingResolver, ExpandRequest, FetcherMap,
    ObservableStream, ReferenceCollector,
};
use crate::error::{QueryError, Result};
use crate::filters::FilterEngine;
use crate::model::EntityTypeDescriptor;
use crate::pagination::{ObjectPage, Paginator};
use crate::params::QueryParams;
use crate::predicate::{FieldPath, Predicate, QueryBuilder};
use crate::record::EntityRecord;
use crate::registry::{PinnedSchema, SchemaRegistry, SchemaSnapshot};
use crate::schema::TableKey;
use crate::scopes::{Access, FilterScope};
use crate::temporal::TemporalTableQuery;
use crate::traits::{ExternalFetcher, QueryExecutor};
use crate::values::parse_scalar;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};

/// A page of records plus the relations embedded in it.
///
/// Holds the schema snapshot the request was resolved against until dropped.
pub struct ListResponse {
    pub page: ObjectPage,
    pub embedded: EmbeddedResultSet,
    schema: PinnedSchema,
}

impl ListResponse {
    pub fn schema(&self) -> &SchemaSnapshot {
        &self.schema
    }
}

#[derive(Debug)]
pub struct DetailResponse {
    pub record: EntityRecord,
    pub embedded: Vec<EmbeddedGroup>,
}

/// Answers list and detail requests against the active schema
pub struct QueryEngine {
    registry: SchemaRegistry,
    executor: Arc<dyn QueryExecutor>,
    config: QueryConfig,
    fetchers: FetcherMap,
}

impl QueryEngine {
    pub fn new(
        registry: SchemaRegistry,
        executor: Arc<dyn QueryExecutor>,
        config: QueryConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            config,
            fetchers: FetcherMap::new(),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    /// Embed `field` of `table` through `fetcher` instead of the executor
    pub fn register_fetcher(
        &mut self,
        table: TableKey,
        field: impl Into<String>,
        fetcher: Arc<dyn ExternalFetcher>,
    ) {
        let field = field.into();
        debug!("External fetcher registered for {}.{}", table, field);
        self.fetchers.insert((table, field), fetcher);
    }

    pub async fn reload(&self) -> Result<Arc<SchemaSnapshot>> {
        self.registry.reload().await
    }

    /// One page of `table`, filtered, sorted and sliced in time by `params`
    pub async fn list(
        &self,
        table: &TableKey,
        params: &QueryParams,
        scopes: &FilterScope,
    ) -> Result<ListResponse> {
        let schema = self.registry.pin().await;
        let model = schema.model_for(table)?.clone();
        check_table_access(&model, scopes)?;

        let temporal = TemporalTableQuery::from_request(&model, params, &self.config)?;
        let filters = FilterEngine::new(&*schema, scopes, &self.config).with_temporal(&temporal);
        let predicate = filters.build(params, &model)?;
        let sort = match params.get(&self.config.params.sort) {
            Some(raw) => filters.parse_sort(raw, &model)?,
            None => Vec::new(),
        };
        let expand = ExpandRequest::from_params(params, &self.config)?;
        let fields = EmbeddingResolver::resolve_fields(
            &*schema,
            &model,
            &expand,
            scopes,
            &self.fetchers,
        )?;
        let paginator = Paginator::from_params(params, &self.config)?;

        let builder = QueryBuilder::new(model.clone())
            .filter(predicate)
            .order_by(sort);
        let builder = temporal.filter_query(builder)?;

        info!(
            "List {} page {} (size {}) at schema {}",
            table,
            paginator.page_number(),
            paginator.page_size(),
            schema.version
        );
        let page = paginator.get_page(self.executor.as_ref(), builder).await?;

        let collector = ReferenceCollector::for_fields(&fields);
        let resolver = EmbeddingResolver::new(
            self.executor.clone(),
            fields,
            temporal,
            self.config.clone(),
        );
        let observer = collector.clone();
        let page = page.map_items(move |items| ObservableStream::new(items, observer).boxed());

        Ok(ListResponse {
            page,
            embedded: EmbeddedResultSet::new(Arc::new(resolver), collector),
            schema,
        })
    }

    /// A single record by `identifier`, or `identifier.version` for temporal tables
    pub async fn detail(
        &self,
        table: &TableKey,
        id: &str,
        params: &QueryParams,
        scopes: &FilterScope,
    ) -> Result<DetailResponse> {
        let schema = self.registry.pin().await;
        let model = schema.model_for(table)?.clone();
        check_table_access(&model, scopes)?;

        let temporal = TemporalTableQuery::from_request(&model, params, &self.config)?;
        let expand = ExpandRequest::from_params(params, &self.config)?;
        let fields = EmbeddingResolver::resolve_fields(
            &*schema,
            &model,
            &expand,
            scopes,
            &self.fetchers,
        )?;

        let (identity, has_version) = identity_predicate(&model, id)?;
        let builder = QueryBuilder::new(model.clone()).filter(identity);
        let builder = if has_version {
            builder
        } else {
            temporal.filter_object_version(builder)?
        };

        let mut records = self.executor.execute(builder.limit(1).build()).await?;
        let record = match records.next().await {
            Some(record) => record?,
            None => {
                return Err(QueryError::not_found(format!(
                    "{} has no object with id '{}'",
                    table, id
                )))
            }
        };
        drop(records);

        let resolver = EmbeddingResolver::new(
            self.executor.clone(),
            fields,
            temporal,
            self.config.clone(),
        );
        let embedded = resolver.embed_list(std::slice::from_ref(&record)).await?;
        Ok(DetailResponse { record, embedded })
    }
}

fn check_table_access(model: &EntityTypeDescriptor, scopes: &FilterScope) -> Result<()> {
    for requirement in [&model.dataset_auth, &model.table_auth] {
        if requirement.evaluate(scopes) == Access::Denied {
            return Err(QueryError::permission_denied(
                model.key.to_string(),
                format!("requires scope {}", requirement),
            ));
        }
    }
    Ok(())
}

/// Predicate selecting `id`, and whether it named an exact version
fn identity_predicate(model: &EntityTypeDescriptor, id: &str) -> Result<(Predicate, bool)> {
    let parse = |field: &str, raw: &str| {
        let scalar = model
            .field(field)
            .and_then(|f| f.storage.scalar())
            .ok_or_else(|| QueryError::invariant(format!("{}.{} is not a scalar", model.key, field)))?;
        parse_scalar(scalar, raw).map_err(|msg| QueryError::validation("id", msg))
    };

    if let (Some(version_field), Some((identifier, version))) =
        (model.version_field(), id.rsplit_once('.'))
    {
        let version_value = parse(version_field, version);
        if let Ok(version_value) = version_value {
            let predicate = Predicate::and(vec![
                Predicate::eq(FieldPath::field(&model.identifier), parse(&model.identifier, identifier)?),
                Predicate::eq(FieldPath::field(version_field), version_value),
            ]);
            return Ok((predicate, true));
        }
    }

    let value = parse(&model.identifier, id)?;
    Ok((Predicate::eq(FieldPath::field(&model.identifier), value), false))
}
