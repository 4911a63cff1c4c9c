//! Temporal resolution.
//!
//! Versioned tables hold several rows per logical identifier. A request
//! either names an exact version, slices the table at a point in time on
//! one of its dimensions (`geldigOp=2021-01-01`), or asks for every version
//! (`geldigOp=*`). Without any of these the slice is taken at "now".

use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::model::{EntityTypeDescriptor, ScalarType};
use crate::params::QueryParams;
use crate::predicate::{DistinctOn, FieldPath, Predicate, QueryBuilder, SortKey};
use crate::schema::{TableKey, TemporalConfig};
use crate::values::{parse_scalar, Instant};
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

/// Value of a dimension parameter
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SliceValue {
    /// `*`: no restriction, every version
    All,
    At(Instant),
}

/// Temporal selection of one request against one table
#[derive(Debug, Clone)]
pub struct TemporalTableQuery {
    table: TableKey,
    pub is_versioned: bool,
    pub version_field: Option<String>,
    pub version_value: Option<Value>,
    pub slice_dimension: Option<String>,
    pub slice_value: Option<SliceValue>,
    /// (start, end) fields of the active or default dimension
    pub range_fields: Option<(String, String)>,
    now: DateTime<Utc>,
}

impl TemporalTableQuery {
    /// Read the version and dimension parameters that apply to `table`
    pub fn from_request(
        table: &EntityTypeDescriptor,
        params: &QueryParams,
        config: &QueryConfig,
    ) -> Result<Self> {
        let mut query = Self::unversioned(table);
        let Some(temporal) = &table.temporal else {
            return Ok(query);
        };
        query.is_versioned = true;
        query.version_field = Some(temporal.version_field.clone());

        if let Some(raw) = params.get(&temporal.version_field) {
            let version_type = table
                .field(&temporal.version_field)
                .and_then(|f| f.storage.scalar())
                .unwrap_or(ScalarType::Integer);
            let value = parse_scalar(version_type, raw)
                .map_err(|msg| QueryError::validation(&temporal.version_field, msg))?;
            query.version_value = Some(value);
        }

        let given: Vec<&str> = temporal
            .dimensions
            .iter()
            .map(|(name, _)| name.as_str())
            .filter(|name| params.contains(name))
            .collect();
        if given.len() > 1 {
            return Err(QueryError::validation(
                given[1],
                format!("only one temporal dimension can be given, found {}", given.join(", ")),
            ));
        }

        if let Some(&dimension) = given.first() {
            let raw = params.get(dimension).unwrap_or_default();
            query.slice_dimension = Some(dimension.to_string());
            query.slice_value = Some(parse_slice(dimension, raw)?);
        }

        let dimension = query
            .slice_dimension
            .clone()
            .or_else(|| default_dimension(temporal, config));
        query.range_fields = dimension
            .and_then(|name| temporal.dimension(&name))
            .map(|d| (d.start.clone(), d.end.clone()));

        debug!(
            "Temporal query for {}: version={:?} slice={:?} range={:?}",
            query.table, query.version_value, query.slice_value, query.range_fields
        );
        Ok(query)
    }

    /// Same slice applied to another table, e.g. the target of an embedded relation.
    ///
    /// Only the dimension value carries over; an explicit version never does.
    pub fn for_related(&self, table: &EntityTypeDescriptor, config: &QueryConfig) -> Self {
        let mut query = Self::unversioned(table);
        query.now = self.now;
        let Some(temporal) = &table.temporal else {
            return query;
        };
        query.is_versioned = true;
        query.version_field = Some(temporal.version_field.clone());

        let shared = self
            .slice_dimension
            .as_deref()
            .filter(|name| temporal.dimension(name).is_some());
        if let Some(name) = shared {
            query.slice_dimension = Some(name.to_string());
            query.slice_value = self.slice_value;
        }
        let dimension = query
            .slice_dimension
            .clone()
            .or_else(|| default_dimension(temporal, config));
        query.range_fields = dimension
            .and_then(|name| temporal.dimension(&name))
            .map(|d| (d.start.clone(), d.end.clone()));
        query
    }

    fn unversioned(table: &EntityTypeDescriptor) -> Self {
        Self {
            table: table.key.clone(),
            is_versioned: false,
            version_field: None,
            version_value: None,
            slice_dimension: None,
            slice_value: None,
            range_fields: None,
            now: Utc::now(),
        }
    }

    /// Pin "now" for requests without an explicit slice
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn table(&self) -> &TableKey {
        &self.table
    }

    pub fn is_all_versions(&self) -> bool {
        self.slice_value == Some(SliceValue::All)
    }

    /// Restrict a single-object lookup to the requested version
    pub fn filter_object_version(&self, builder: QueryBuilder) -> Result<QueryBuilder> {
        self.check_table(builder.table())?;
        if !self.is_versioned {
            return Ok(builder);
        }
        match (&self.version_field, &self.version_value) {
            (Some(field), Some(value)) => {
                Ok(builder.filter(Predicate::eq(FieldPath::field(field), value.clone())))
            }
            _ => self.filter_query(builder),
        }
    }

    /// Restrict a listing to one version per identifier
    pub fn filter_query(&self, builder: QueryBuilder) -> Result<QueryBuilder> {
        self.check_table(builder.table())?;
        if !self.is_versioned || self.is_all_versions() {
            return Ok(builder);
        }

        match &self.range_fields {
            Some((start, end)) => {
                let value = self.instant_value(builder.table(), start);
                let (_, version) = self.identity_paths(builder.table())?;
                Ok(builder
                    .filter(Predicate::within_range(
                        FieldPath::field(start),
                        FieldPath::field(end),
                        value,
                    ))
                    .order_by([SortKey::desc(FieldPath::field(start)), SortKey::desc(version)]))
            }
            None => {
                let (identifier, version) = self.identity_paths(builder.table())?;
                Ok(builder.distinct_on(DistinctOn {
                    keys: vec![identifier.clone()],
                    order: vec![SortKey::asc(identifier), SortKey::desc(version)],
                }))
            }
        }
    }

    /// Restrict the temporal target of `relation` on the builder's table.
    ///
    /// `target` must be the table this query was built for.
    pub fn filter_related_query(
        &self,
        builder: QueryBuilder,
        relation: &str,
        target: &EntityTypeDescriptor,
    ) -> Result<QueryBuilder> {
        self.check_table(target)?;
        let points_at_target = builder
            .table()
            .field(relation)
            .and_then(|f| f.storage.relation())
            .is_some_and(|fk| fk.target == self.table);
        if !points_at_target {
            return Err(QueryError::invariant(format!(
                "{}.{} is not a relation to {}",
                builder.table().key,
                relation,
                self.table
            )));
        }
        match self.related_predicate(&FieldPath::field(relation), target)? {
            Some(predicate) => Ok(builder.filter(predicate)),
            None => Ok(builder),
        }
    }

    /// Condition selecting the valid version of `target` rows reached through `prefix`.
    ///
    /// `None` when every version of the target may match.
    pub fn related_predicate(
        &self,
        prefix: &FieldPath,
        target: &EntityTypeDescriptor,
    ) -> Result<Option<Predicate>> {
        self.check_table(target)?;
        if !self.is_versioned || self.is_all_versions() {
            return Ok(None);
        }
        let predicate = match &self.range_fields {
            Some((start, end)) => Predicate::within_range(
                FieldPath::field(start).under(prefix),
                FieldPath::field(end).under(prefix),
                self.instant_value(target, start),
            ),
            None => {
                let (identifier, version) = self.identity_paths(target)?;
                Predicate::LatestVersion {
                    identifier: identifier.under(prefix),
                    version: version.under(prefix),
                }
            }
        };
        Ok(Some(predicate))
    }

    fn check_table(&self, table: &EntityTypeDescriptor) -> Result<()> {
        if table.key != self.table {
            return Err(QueryError::invariant(format!(
                "temporal query for {} applied to {}",
                self.table, table.key
            )));
        }
        Ok(())
    }

    fn identity_paths(&self, table: &EntityTypeDescriptor) -> Result<(FieldPath, FieldPath)> {
        let version = self.version_field.as_ref().ok_or_else(|| {
            QueryError::invariant(format!("{} has no version field", self.table))
        })?;
        Ok((
            FieldPath::field(&table.identifier),
            FieldPath::field(version),
        ))
    }

    fn instant_value(&self, table: &EntityTypeDescriptor, start: &str) -> Value {
        let instant = match self.slice_value {
            Some(SliceValue::At(instant)) => instant,
            _ => Instant::DateTime(self.now),
        };
        let target = table
            .field(start)
            .and_then(|f| f.storage.scalar())
            .unwrap_or(ScalarType::DateTime);
        instant.to_value(target)
    }
}

/// Prefer the configured "valid on" dimension, otherwise the first declared one
pub fn default_dimension(temporal: &TemporalConfig, config: &QueryConfig) -> Option<String> {
    temporal
        .dimension(&config.valid_on_dimension)
        .map(|_| config.valid_on_dimension.clone())
        .or_else(|| temporal.dimensions.first().map(|(name, _)| name.clone()))
}

fn parse_slice(dimension: &str, raw: &str) -> Result<SliceValue> {
    if raw.trim() == "*" {
        return Ok(SliceValue::All);
    }
    Instant::parse(raw).map(SliceValue::At).ok_or_else(|| {
        QueryError::validation(
            dimension,
            format!("'{}' is not a valid date or date-time", raw),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityModelFactory;
    use crate::predicate::{CompareOp, QuerySpec};
    use crate::schema::DatasetSchema;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Arc;

    fn models() -> (Arc<EntityTypeDescriptor>, Arc<EntityTypeDescriptor>, Arc<EntityTypeDescriptor>) {
        let dataset = DatasetSchema::from_value(json!({
            "id": "gebieden",
            "tables": [
                {
                    "id": "wijken",
                    "temporal": {
                        "identifier": "volgnummer",
                        "dimensions": {
                            "registratie": ["registratiedatum", "eindRegistratie"],
                            "geldigOp": ["beginGeldigheid", "eindGeldigheid"]
                        }
                    },
                    "schema": {
                        "identifier": ["identificatie", "volgnummer"],
                        "properties": {
                            "identificatie": {"type": "string"},
                            "volgnummer": {"type": "integer"},
                            "beginGeldigheid": {"type": "string", "format": "date"},
                            "eindGeldigheid": {"type": "string", "format": "date"},
                            "registratiedatum": {"type": "string", "format": "date-time"},
                            "eindRegistratie": {"type": "string", "format": "date-time"}
                        }
                    }
                },
                {
                    "id": "sequenced",
                    "temporal": {"identifier": "volgnummer"},
                    "schema": {
                        "identifier": ["identificatie", "volgnummer"],
                        "properties": {
                            "identificatie": {"type": "string"},
                            "volgnummer": {"type": "integer"}
                        }
                    }
                },
                {
                    "id": "buurten",
                    "schema": {
                        "properties": {
                            "id": {"type": "integer"},
                            "wijk": {"type": "string", "relation": "wijken"},
                            "reeks": {"type": "string", "relation": "sequenced"}
                        }
                    }
                }
            ]
        }))
        .unwrap();
        let set = EntityModelFactory::build_all(&[Arc::new(dataset)]);
        let get = |t: &str| set.models[&TableKey::new("gebieden", t)].clone();
        (get("wijken"), get("sequenced"), get("buurten"))
    }

    fn config() -> QueryConfig {
        QueryConfig::default()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn build(query: &TemporalTableQuery, table: &Arc<EntityTypeDescriptor>) -> QuerySpec {
        query
            .filter_query(QueryBuilder::new(table.clone()))
            .unwrap()
            .build()
    }

    #[test]
    fn test_default_dimension_prefers_valid_on() {
        let (wijken, _, _) = models();
        let query = TemporalTableQuery::from_request(&wijken, &QueryParams::new(), &config()).unwrap();
        assert!(query.is_versioned);
        assert_eq!(
            query.range_fields,
            Some(("beginGeldigheid".to_string(), "eindGeldigheid".to_string()))
        );

        let mut other = config();
        other.valid_on_dimension = "bestaatOp".to_string();
        let query = TemporalTableQuery::from_request(&wijken, &QueryParams::new(), &other).unwrap();
        assert_eq!(
            query.range_fields,
            Some(("registratiedatum".to_string(), "eindRegistratie".to_string()))
        );
    }

    #[test]
    fn test_slice_emits_half_open_interval() {
        let (wijken, _, _) = models();
        let params = QueryParams::new().with("geldigOp", "2021-06-01");
        let query = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap();
        let spec = build(&query, &wijken);

        assert_eq!(
            spec.predicate,
            Predicate::within_range(
                FieldPath::field("beginGeldigheid"),
                FieldPath::field("eindGeldigheid"),
                json!("2021-06-01")
            )
        );
        assert_eq!(
            spec.ordering,
            vec![
                SortKey::desc(FieldPath::field("beginGeldigheid")),
                SortKey::desc(FieldPath::field("volgnummer")),
            ]
        );
    }

    #[test]
    fn test_no_slice_uses_now() {
        let (wijken, _, _) = models();
        let query = TemporalTableQuery::from_request(&wijken, &QueryParams::new(), &config())
            .unwrap()
            .with_now(now());
        let spec = build(&query, &wijken);
        match spec.predicate {
            Predicate::And(parts) => assert_eq!(
                parts[0],
                Predicate::compare(
                    FieldPath::field("beginGeldigheid"),
                    CompareOp::Lte,
                    json!("2024-03-01")
                )
            ),
            other => panic!("unexpected predicate {:?}", other),
        }
    }

    #[test]
    fn test_datetime_dimension_value() {
        let (wijken, _, _) = models();
        let params = QueryParams::new().with("registratie", "2021-06-01");
        let query = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap();
        let spec = build(&query, &wijken);
        assert_eq!(
            spec.predicate,
            Predicate::within_range(
                FieldPath::field("registratiedatum"),
                FieldPath::field("eindRegistratie"),
                json!("2021-06-01T00:00:00Z")
            )
        );
    }

    #[test]
    fn test_star_means_all_versions() {
        let (wijken, _, _) = models();
        let params = QueryParams::new().with("geldigOp", "*");
        let query = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap();
        assert!(query.is_all_versions());
        let spec = build(&query, &wijken);
        assert!(spec.predicate.is_always());
        assert!(spec.distinct_on.is_none());
    }

    #[test]
    fn test_malformed_slice_is_validation_error() {
        let (wijken, _, _) = models();
        let params = QueryParams::new().with("geldigOp", "foo");
        let err = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap_err();
        assert!(matches!(err, QueryError::Validation { ref param, .. } if param == "geldigOp"));
    }

    #[test]
    fn test_two_dimensions_rejected() {
        let (wijken, _, _) = models();
        let params = QueryParams::new()
            .with("geldigOp", "2021-01-01")
            .with("registratie", "2021-01-01");
        assert!(TemporalTableQuery::from_request(&wijken, &params, &config()).is_err());
    }

    #[test]
    fn test_sequence_only_table_deduplicates() {
        let (_, sequenced, _) = models();
        let query = TemporalTableQuery::from_request(&sequenced, &QueryParams::new(), &config()).unwrap();
        assert!(query.range_fields.is_none());
        let spec = build(&query, &sequenced);
        assert_eq!(
            spec.distinct_on,
            Some(DistinctOn {
                keys: vec![FieldPath::field("identificatie")],
                order: vec![
                    SortKey::asc(FieldPath::field("identificatie")),
                    SortKey::desc(FieldPath::field("volgnummer")),
                ],
            })
        );
    }

    #[test]
    fn test_object_version_uses_exact_version() {
        let (wijken, _, _) = models();
        let params = QueryParams::new().with("volgnummer", "3");
        let query = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap();
        let spec = query
            .filter_object_version(QueryBuilder::new(wijken.clone()))
            .unwrap()
            .build();
        assert_eq!(spec.predicate, Predicate::eq(FieldPath::field("volgnummer"), json!(3)));

        let params = QueryParams::new().with("volgnummer", "drie");
        assert!(TemporalTableQuery::from_request(&wijken, &params, &config()).is_err());
    }

    #[test]
    fn test_mismatched_table_is_invariant_violation() {
        let (wijken, sequenced, _) = models();
        let query = TemporalTableQuery::from_request(&wijken, &QueryParams::new(), &config()).unwrap();
        let err = query
            .filter_query(QueryBuilder::new(sequenced))
            .unwrap_err();
        assert!(matches!(err, QueryError::InvariantViolation(_)));
    }

    #[test]
    fn test_related_query_prefixes_paths() {
        let (wijken, sequenced, buurten) = models();
        let params = QueryParams::new().with("geldigOp", "2021-06-01");
        let query = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap();
        let spec = query
            .filter_related_query(QueryBuilder::new(buurten.clone()), "wijk", &wijken)
            .unwrap()
            .build();
        assert_eq!(
            spec.predicate,
            Predicate::within_range(
                FieldPath::new(["wijk", "beginGeldigheid"]),
                FieldPath::new(["wijk", "eindGeldigheid"]),
                json!("2021-06-01")
            )
        );

        let query = TemporalTableQuery::from_request(&sequenced, &QueryParams::new(), &config()).unwrap();
        let spec = query
            .filter_related_query(QueryBuilder::new(buurten.clone()), "reeks", &sequenced)
            .unwrap()
            .build();
        assert_eq!(
            spec.predicate,
            Predicate::LatestVersion {
                identifier: FieldPath::new(["reeks", "identificatie"]),
                version: FieldPath::new(["reeks", "volgnummer"]),
            }
        );

        // relation pointing elsewhere
        assert!(query
            .filter_related_query(QueryBuilder::new(buurten), "wijk", &sequenced)
            .is_err());
    }

    #[test]
    fn test_for_related_drops_version() {
        let (wijken, _, _) = models();
        let params = QueryParams::new()
            .with("volgnummer", "2")
            .with("geldigOp", "2020-01-01");
        let query = TemporalTableQuery::from_request(&wijken, &params, &config()).unwrap();
        let related = query.for_related(&wijken, &config());
        assert!(related.version_value.is_none());
        assert_eq!(related.slice_dimension.as_deref(), Some("geldigOp"));
    }
}
