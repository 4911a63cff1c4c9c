//! In-memory representation of dataset schema documents.
//!
//! A document is parsed structurally here; type validation happens when the
//! entity model is built (see [`crate::model`]), so that a single broken
//! table does not reject the whole dataset.

use crate::error::{QueryError, Result};
use crate::model::SkippedTable;
use crate::scopes::ScopeRequirement;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Identifies a table across datasets: `dataset:table`
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TableKey {
    pub dataset: String,
    pub table: String,
}

impl TableKey {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parse a relation reference; a bare table name resolves in `default_dataset`
    pub fn parse_relation(reference: &str, default_dataset: &str) -> Self {
        match reference.split_once(':') {
            Some((dataset, table)) => Self::new(dataset, table),
            None => Self::new(default_dataset, reference),
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dataset, self.table)
    }
}

/// A loaded dataset. Immutable; a reload produces a new value.
#[derive(Debug, Clone)]
pub struct DatasetSchema {
    pub id: String,
    pub crs: Option<String>,
    pub auth: ScopeRequirement,
    pub tables: Vec<Arc<TableSchema>>,
    /// Tables whose declaration could not be parsed
    pub skipped: Vec<SkippedTable>,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub id: String,
    pub dataset_id: String,
    pub fields: Vec<FieldSchema>,
    /// Identifier field names; temporal tables list the version field too
    pub identifier: Vec<String>,
    pub temporal: Option<TemporalConfig>,
    pub additional_filters: Vec<(String, RangeFilter)>,
    pub auth: ScopeRequirement,
    pub main_geometry: Option<String>,
    pub display: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    /// Declared JSON type (`string`, `integer`, `object`, ...); `None` for `$ref` fields
    pub type_name: Option<String>,
    /// `$ref` URL, used for GeoJSON geometries
    pub reference: Option<String>,
    pub format: Option<String>,
    pub relation: Option<RelationDescriptor>,
    /// Properties of an object field, or of the items of an array-of-object field
    pub subfields: Vec<FieldSchema>,
    /// Item declaration of an array field
    pub items: Option<Box<FieldSchema>>,
    pub auth: ScopeRequirement,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub target: TableKey,
    /// Resolved by value only; the backend does not enforce integrity
    pub loose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporalConfig {
    pub version_field: String,
    /// Dimensions in declaration order
    pub dimensions: Vec<(String, DimensionFields)>,
}

/// Half-open validity interval `[start, end)` of a temporal dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionFields {
    pub start: String,
    pub end: String,
}

/// A named range filter: `start <= value AND (end IS NULL OR value < end)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub start: String,
    pub end: String,
}

impl DatasetSchema {
    pub fn from_json(document: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(document)?;
        Self::from_value(value)
    }

    pub fn from_value(document: Value) -> Result<Self> {
        let raw: RawDataset = serde_json::from_value(document)?;
        if let Some(kind) = raw.kind.as_deref() {
            if kind != "dataset" {
                return Err(QueryError::Serialization(format!(
                    "Document '{}' has type '{}', expected 'dataset'",
                    raw.id, kind
                )));
            }
        }

        let mut tables = Vec::with_capacity(raw.tables.len());
        let mut skipped = Vec::new();
        for (index, value) in raw.tables.into_iter().enumerate() {
            let table_id = value
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("#{}", index));
            let parsed = serde_json::from_value::<RawTable>(value)
                .map_err(QueryError::from)
                .and_then(|raw_table| raw_table.into_table(&raw.id));
            match parsed {
                Ok(table) => tables.push(table),
                Err(error) => {
                    warn!("Skipping table {}:{}: {}", raw.id, table_id, error);
                    skipped.push(SkippedTable {
                        key: TableKey::new(&raw.id, table_id),
                        error,
                    });
                }
            }
        }

        mark_loose_relations(&raw.id, &mut tables);

        Ok(Self {
            id: raw.id,
            crs: raw.crs,
            auth: raw.auth.map(RawAuth::into_requirement).unwrap_or_default(),
            tables: tables.into_iter().map(Arc::new).collect(),
            skipped,
        })
    }

    pub fn table(&self, id: &str) -> Option<&Arc<TableSchema>> {
        self.tables.iter().find(|t| t.id == id)
    }
}

impl TableSchema {
    pub fn key(&self) -> TableKey {
        TableKey::new(&self.dataset_id, &self.id)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal.is_some()
    }

    /// Identifier of the logical entity, excluding the version field
    pub fn logical_identifier(&self) -> &str {
        let version = self.temporal.as_ref().map(|t| t.version_field.as_str());
        self.identifier
            .iter()
            .find(|name| Some(name.as_str()) != version)
            .or_else(|| self.identifier.first())
            .map(String::as_str)
            .unwrap_or("id")
    }

    pub fn additional_filter(&self, name: &str) -> Option<&RangeFilter> {
        self.additional_filters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, f)| f)
    }
}

impl FieldSchema {
    pub fn is_array(&self) -> bool {
        self.type_name.as_deref() == Some("array")
    }

    pub fn is_object(&self) -> bool {
        self.type_name.as_deref() == Some("object")
    }

    pub fn subfield(&self, name: &str) -> Option<&FieldSchema> {
        self.subfields.iter().find(|f| f.name == name)
    }
}

impl TemporalConfig {
    pub fn dimension(&self, name: &str) -> Option<&DimensionFields> {
        self.dimensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }
}

/// A scalar relation into a temporal table only stores the identifier, so
/// the version has to be resolved by value.
fn mark_loose_relations(dataset_id: &str, tables: &mut [TableSchema]) {
    let temporal: Vec<String> = tables
        .iter()
        .filter(|t| t.is_temporal())
        .map(|t| t.id.clone())
        .collect();

    for table in tables.iter_mut() {
        for field in table.fields.iter_mut() {
            let scalar = field.subfields.is_empty();
            if let Some(relation) = field.relation.as_mut() {
                if scalar
                    && relation.target.dataset == dataset_id
                    && temporal.contains(&relation.target.table)
                {
                    relation.loose = true;
                }
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAuth {
    One(String),
    Many(Vec<String>),
}

impl RawAuth {
    fn into_requirement(self) -> ScopeRequirement {
        match self {
            RawAuth::One(scope) => ScopeRequirement::any_of([scope]),
            RawAuth::Many(scopes) => ScopeRequirement::any_of(scopes),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdentifier {
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
struct RawDataset {
    id: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    crs: Option<String>,
    #[serde(default)]
    auth: Option<RawAuth>,
    #[serde(default)]
    tables: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTable {
    id: String,
    #[serde(default)]
    auth: Option<RawAuth>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    temporal: Option<RawTemporal>,
    #[serde(default)]
    additional_filters: Map<String, Value>,
    schema: RawTableSchema,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTableSchema {
    #[serde(default)]
    identifier: Option<RawIdentifier>,
    #[serde(default)]
    main_geometry: Option<String>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawTemporal {
    identifier: String,
    #[serde(default)]
    dimensions: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawRangeFilter {
    #[serde(rename = "type")]
    kind: String,
    start: String,
    end: String,
}

#[derive(Deserialize)]
struct RawField {
    #[serde(rename = "type", default)]
    type_name: Option<String>,
    #[serde(rename = "$ref", default)]
    reference: Option<String>,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    relation: Option<String>,
    #[serde(default)]
    loose: bool,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    items: Option<Value>,
    #[serde(default)]
    auth: Option<RawAuth>,
    #[serde(default)]
    description: Option<String>,
}

impl RawTable {
    fn into_table(self, dataset_id: &str) -> Result<TableSchema> {
        let context = format!("{}:{}", dataset_id, self.id);

        let mut fields = Vec::with_capacity(self.schema.properties.len());
        for (name, value) in self.schema.properties {
            fields.push(parse_field(&context, dataset_id, name, value)?);
        }

        let temporal = match self.temporal {
            Some(raw) => {
                let mut dimensions = Vec::with_capacity(raw.dimensions.len());
                for (name, value) in raw.dimensions {
                    let pair: Vec<String> = serde_json::from_value(value).map_err(|e| {
                        QueryError::Serialization(format!(
                            "{}: dimension '{}' must be a [start, end] pair: {}",
                            context, name, e
                        ))
                    })?;
                    match <[String; 2]>::try_from(pair) {
                        Ok([start, end]) => dimensions.push((name, DimensionFields { start, end })),
                        Err(_) => {
                            return Err(QueryError::Serialization(format!(
                                "{}: dimension '{}' must list exactly two fields",
                                context, name
                            )))
                        }
                    }
                }
                Some(TemporalConfig {
                    version_field: raw.identifier,
                    dimensions,
                })
            }
            None => None,
        };

        let mut additional_filters = Vec::with_capacity(self.additional_filters.len());
        for (name, value) in self.additional_filters {
            let raw: RawRangeFilter = serde_json::from_value(value)?;
            if raw.kind != "range" {
                return Err(QueryError::Serialization(format!(
                    "{}: additional filter '{}' has unsupported type '{}'",
                    context, name, raw.kind
                )));
            }
            additional_filters.push((
                name,
                RangeFilter {
                    start: raw.start,
                    end: raw.end,
                },
            ));
        }

        let identifier = match self.schema.identifier {
            Some(RawIdentifier::One(id)) => vec![id],
            Some(RawIdentifier::Many(ids)) => ids,
            None => vec!["id".to_string()],
        };

        Ok(TableSchema {
            id: self.id,
            dataset_id: dataset_id.to_string(),
            fields,
            identifier,
            temporal,
            additional_filters,
            auth: self.auth.map(RawAuth::into_requirement).unwrap_or_default(),
            main_geometry: self.schema.main_geometry,
            display: self.schema.display,
            description: self.description,
        })
    }
}

fn parse_field(context: &str, dataset_id: &str, name: String, value: Value) -> Result<FieldSchema> {
    let raw: RawField = serde_json::from_value(value).map_err(|e| {
        QueryError::Serialization(format!("{}: field '{}': {}", context, name, e))
    })?;

    let mut subfields = Vec::new();
    if let Some(properties) = raw.properties {
        for (sub_name, sub_value) in properties {
            subfields.push(parse_field(context, dataset_id, sub_name, sub_value)?);
        }
    }

    let items = match raw.items {
        Some(items) => {
            let item = parse_field(context, dataset_id, format!("{}[]", name), items)?;
            if subfields.is_empty() {
                subfields = item.subfields.clone();
            }
            Some(Box::new(item))
        }
        None => None,
    };

    let relation = raw.relation.map(|reference| RelationDescriptor {
        target: TableKey::parse_relation(&reference, dataset_id),
        loose: raw.loose,
    });

    Ok(FieldSchema {
        name,
        type_name: raw.type_name,
        reference: raw.reference,
        format: raw.format,
        relation,
        subfields,
        items,
        auth: raw.auth.map(RawAuth::into_requirement).unwrap_or_default(),
        description: raw.description,
    })
}
