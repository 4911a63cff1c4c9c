//! # dso-query
//!
//! Query core for schema-described, versioned datasets.
//!
//! Datasets are described by JSON schema documents. Each table is mapped to an
//! [`EntityTypeDescriptor`] and records of every table share the generic
//! [`EntityRecord`] type. Requests are answered by combining:
//!
//! - **Filters**: `field[lookup]=value` parameters, including traversal of
//!   relations, checked against the caller's scopes
//! - **Temporal resolution**: exact versions, point-in-time slices on a
//!   dimension such as `geldigOp`, or the full history with `*`
//! - **Pagination**: page numbers without count queries; one extra record
//!   tells whether a next page exists
//! - **Embedding**: related records fetched in bulk once the referenced ids
//!   are known
//!
//! Storage is abstracted behind [`QueryExecutor`], which receives a
//! backend-agnostic [`QuerySpec`] and returns a lazy [`RecordStream`]. Schema
//! documents come from a [`SchemaSource`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use dso_query::{FilterScope, QueryConfig, QueryEngine, QueryParams, SchemaRegistry, TableKey};
//! use futures::TryStreamExt;
//! use std::sync::Arc;
//!
//! # async fn example(
//! #     source: Arc<dyn dso_query::SchemaSource>,
//! #     executor: Arc<dyn dso_query::QueryExecutor>,
//! # ) -> dso_query::Result<()> {
//! let registry = SchemaRegistry::load(source).await?;
//! let engine = QueryEngine::new(registry, executor, QueryConfig::from_env()?);
//!
//! let params = QueryParams::parse("naam[like]=Oost*&geldigOp=2021-01-01&_expandScope=ligtInWijk")?;
//! let scopes = FilterScope::new(["FP/MDW"]);
//! let mut response = engine
//!     .list(&TableKey::new("gebieden", "buurten"), &params, &scopes)
//!     .await?;
//!
//! if let Some(items) = response.page.take_items() {
//!     let records: Vec<_> = items.try_collect().await?;
//!     println!("{} records, next page: {:?}", records.len(), response.page.has_next());
//! }
//! let embedded = response.embedded.fetch().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod filters;
pub mod model;
pub mod pagination;
pub mod params;
pub mod predicate;
pub mod record;
pub mod registry;
pub mod schema;
pub mod scopes;
pub mod temporal;
pub mod traits;
pub mod values;

// Re-export commonly used items
pub use config::{ParamNames, QueryConfig};
pub use embedding::{
    EmbeddedField, EmbeddedGroup, EmbeddedResultSet, EmbeddingResolver, ExpandRequest,
    FetchStrategy, ObservableStream, ReferenceCollector, StreamObserver,
};
pub use engine::{DetailResponse, ListResponse, QueryEngine};
pub use error::{ErrorKind, QueryError, Result};
pub use filters::{FilterEngine, FilterTarget, Lookup, ParsedFilter};
pub use model::{
    EntityModelFactory, EntityTypeDescriptor, FieldDescriptor, ForeignKey, GeometryKind,
    ModelLookup, ModelSet, RelationKey, ScalarType, StorageType,
};
pub use pagination::{ObjectPage, PageState, Paginator};
pub use params::QueryParams;
pub use predicate::{
    CompareOp, DistinctOn, FieldPath, GeometryLiteral, Predicate, QueryBuilder, QuerySpec,
    SortKey, WildcardPattern, WildcardToken,
};
pub use record::{DataRow, EntityRecord, ObjectId};
pub use registry::{PinnedSchema, SchemaRegistry, SchemaSnapshot};
pub use schema::{DatasetSchema, FieldSchema, TableKey, TableSchema, TemporalConfig};
pub use scopes::{Access, FilterScope, ScopeRequirement};
pub use temporal::{SliceValue, TemporalTableQuery};
pub use traits::{ExternalFetcher, QueryExecutor, RecordStream, SchemaSource};
