//! Entity model factory.
//!
//! Every table of a loaded schema is mapped once to an
//! [`EntityTypeDescriptor`]: a static description of its fields, their
//! storage representation, relations and primary key. Records of any table
//! share one generic type ([`crate::record::EntityRecord`]) that is read
//! through its descriptor.

use crate::error::{QueryError, Result};
use crate::schema::{DatasetSchema, FieldSchema, RangeFilter, TableKey, TableSchema, TemporalConfig};
use crate::scopes::ScopeRequirement;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

const GEOJSON_PREFIX: &str = "https://geojson.org/schema/";

/// Storage representation of a scalar value
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Text,
    Integer,
    Decimal,
    Boolean,
    Date,
    DateTime,
    Time,
    Uuid,
}

impl ScalarType {
    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            ScalarType::Integer
                | ScalarType::Decimal
                | ScalarType::Date
                | ScalarType::DateTime
                | ScalarType::Time
        )
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, ScalarType::Date | ScalarType::DateTime)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarType::Text => write!(f, "text"),
            ScalarType::Integer => write!(f, "integer"),
            ScalarType::Decimal => write!(f, "decimal"),
            ScalarType::Boolean => write!(f, "boolean"),
            ScalarType::Date => write!(f, "date"),
            ScalarType::DateTime => write!(f, "date-time"),
            ScalarType::Time => write!(f, "time"),
            ScalarType::Uuid => write!(f, "uuid"),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize)]
pub enum GeometryKind {
    Geometry,
    Point,
    MultiPoint,
    LineString,
    MultiLineString,
    Polygon,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryKind {
    fn from_reference(reference: &str) -> Option<Self> {
        let name = reference.strip_prefix(GEOJSON_PREFIX)?.strip_suffix(".json")?;
        Some(match name {
            "Geometry" => GeometryKind::Geometry,
            "Point" => GeometryKind::Point,
            "MultiPoint" => GeometryKind::MultiPoint,
            "LineString" => GeometryKind::LineString,
            "MultiLineString" => GeometryKind::MultiLineString,
            "Polygon" => GeometryKind::Polygon,
            "MultiPolygon" => GeometryKind::MultiPolygon,
            "GeometryCollection" => GeometryKind::GeometryCollection,
            _ => return None,
        })
    }
}

/// How a related record is identified from the referencing field
#[derive(Debug, Clone, PartialEq)]
pub enum RelationKey {
    /// A single value matched against the target's identifier
    Scalar(ScalarType),
    /// An object holding each component of the target's primary key
    Composite(Vec<FieldDescriptor>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub target: TableKey,
    pub loose: bool,
    pub key: RelationKey,
}

impl ForeignKey {
    pub fn component(&self, name: &str) -> Option<&FieldDescriptor> {
        match &self.key {
            RelationKey::Composite(parts) => parts.iter().find(|p| p.name == name),
            RelationKey::Scalar(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageType {
    Scalar(ScalarType),
    Geometry(GeometryKind),
    /// Array of scalar values
    Array(ScalarType),
    /// Embedded object with named subfields
    Object(Vec<FieldDescriptor>),
    /// Array of objects, stored as a nested table
    NestedTable(Vec<FieldDescriptor>),
    ForeignKey(ForeignKey),
    ManyToMany(ForeignKey),
}

impl StorageType {
    pub fn relation(&self) -> Option<&ForeignKey> {
        match self {
            StorageType::ForeignKey(fk) | StorageType::ManyToMany(fk) => Some(fk),
            _ => None,
        }
    }

    pub fn subfields(&self) -> Option<&[FieldDescriptor]> {
        match self {
            StorageType::Object(fields) | StorageType::NestedTable(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn scalar(&self) -> Option<ScalarType> {
        match self {
            StorageType::Scalar(s) => Some(*s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub storage: StorageType,
    /// Part of the primary key
    pub is_key: bool,
    pub auth: ScopeRequirement,
}

impl FieldDescriptor {
    pub fn subfield(&self, name: &str) -> Option<&FieldDescriptor> {
        self.storage
            .subfields()
            .and_then(|fields| fields.iter().find(|f| f.name == name))
    }
}

/// Static description of one table, built once per schema load
#[derive(Debug, Clone, PartialEq)]
pub struct EntityTypeDescriptor {
    pub key: TableKey,
    pub fields: Vec<FieldDescriptor>,
    /// Primary key fields (identifier, plus version for temporal tables)
    pub primary_key: Vec<String>,
    /// Identifier of the logical entity
    pub identifier: String,
    pub temporal: Option<TemporalConfig>,
    pub additional_filters: Vec<(String, RangeFilter)>,
    pub table_auth: ScopeRequirement,
    pub dataset_auth: ScopeRequirement,
    pub main_geometry: Option<String>,
    pub display: Option<String>,
    index: HashMap<String, usize>,
}

impl EntityTypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn is_temporal(&self) -> bool {
        self.temporal.is_some()
    }

    pub fn version_field(&self) -> Option<&str> {
        self.temporal.as_ref().map(|t| t.version_field.as_str())
    }

    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.storage.relation().is_some())
    }
}

pub struct EntityModelFactory;

impl EntityModelFactory {
    /// Map a table definition to its entity type descriptor.
    ///
    /// Deterministic for identical input; fails with [`QueryError::Schema`]
    /// when a field has no known storage mapping.
    pub fn build(table: &TableSchema, dataset: &DatasetSchema) -> Result<EntityTypeDescriptor> {
        let key = table.key();
        let context = key.to_string();

        let mut fields = Vec::with_capacity(table.fields.len());
        for field in &table.fields {
            let mut descriptor = build_field(&context, &key.dataset, field)?;
            descriptor.is_key = table.identifier.contains(&field.name);
            fields.push(descriptor);
        }

        let index: HashMap<String, usize> = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();

        for name in &table.identifier {
            if !index.contains_key(name) {
                return Err(QueryError::schema(
                    &context,
                    format!("identifier field '{}' is not declared", name),
                ));
            }
        }

        if let Some(temporal) = &table.temporal {
            if !index.contains_key(&temporal.version_field) {
                return Err(QueryError::schema(
                    &context,
                    format!("version field '{}' is not declared", temporal.version_field),
                ));
            }
            for (name, dimension) in &temporal.dimensions {
                for field in [&dimension.start, &dimension.end] {
                    let is_instant = index
                        .get(field)
                        .and_then(|&i| fields[i].storage.scalar())
                        .is_some_and(ScalarType::is_temporal);
                    if !is_instant {
                        return Err(QueryError::schema(
                            &context,
                            format!("dimension '{}' needs a date or date-time field '{}'", name, field),
                        ));
                    }
                }
            }
        }

        for (name, filter) in &table.additional_filters {
            for field in [&filter.start, &filter.end] {
                let declared = index
                    .get(field)
                    .and_then(|&i| fields[i].storage.scalar())
                    .is_some_and(ScalarType::is_ordered);
                if !declared {
                    return Err(QueryError::schema(
                        &context,
                        format!("range filter '{}' needs an ordered field '{}'", name, field),
                    ));
                }
            }
        }

        let mut primary_key = table.identifier.clone();
        if let Some(temporal) = &table.temporal {
            if !primary_key.contains(&temporal.version_field) {
                primary_key.push(temporal.version_field.clone());
            }
        }

        debug!("Built entity model for {} ({} fields)", context, fields.len());

        Ok(EntityTypeDescriptor {
            identifier: table.logical_identifier().to_string(),
            key,
            fields,
            primary_key,
            temporal: table.temporal.clone(),
            additional_filters: table.additional_filters.clone(),
            table_auth: table.auth.clone(),
            dataset_auth: dataset.auth.clone(),
            main_geometry: table.main_geometry.clone(),
            display: table.display.clone(),
            index,
        })
    }

    /// Build every table of the given datasets; tables that fail are skipped
    pub fn build_all(datasets: &[Arc<DatasetSchema>]) -> ModelSet {
        let mut models = HashMap::new();
        let mut skipped = Vec::new();

        for dataset in datasets {
            skipped.extend(dataset.skipped.iter().cloned());
            for table in &dataset.tables {
                match Self::build(table, dataset) {
                    Ok(descriptor) => {
                        models.insert(descriptor.key.clone(), Arc::new(descriptor));
                    }
                    Err(error) => {
                        warn!("Skipping table {}: {}", table.key(), error);
                        skipped.push(SkippedTable {
                            key: table.key(),
                            error,
                        });
                    }
                }
            }
        }

        ModelSet { models, skipped }
    }
}

/// Result of building all tables of a schema load
#[derive(Debug, Default)]
pub struct ModelSet {
    pub models: HashMap<TableKey, Arc<EntityTypeDescriptor>>,
    pub skipped: Vec<SkippedTable>,
}

#[derive(Debug, Clone)]
pub struct SkippedTable {
    pub key: TableKey,
    pub error: QueryError,
}

/// Resolves the descriptor of a (related) table
pub trait ModelLookup {
    fn model(&self, key: &TableKey) -> Option<&Arc<EntityTypeDescriptor>>;
}

impl ModelLookup for HashMap<TableKey, Arc<EntityTypeDescriptor>> {
    fn model(&self, key: &TableKey) -> Option<&Arc<EntityTypeDescriptor>> {
        self.get(key)
    }
}

impl ModelLookup for ModelSet {
    fn model(&self, key: &TableKey) -> Option<&Arc<EntityTypeDescriptor>> {
        self.models.get(key)
    }
}

fn build_field(context: &str, dataset: &str, field: &FieldSchema) -> Result<FieldDescriptor> {
    Ok(FieldDescriptor {
        name: field.name.clone(),
        storage: storage_type(context, dataset, field)?,
        is_key: false,
        auth: field.auth.clone(),
    })
}

fn storage_type(context: &str, dataset: &str, field: &FieldSchema) -> Result<StorageType> {
    if let Some(reference) = &field.reference {
        return GeometryKind::from_reference(reference)
            .map(StorageType::Geometry)
            .ok_or_else(|| {
                QueryError::schema(
                    context,
                    format!("field '{}' references unknown type '{}'", field.name, reference),
                )
            });
    }

    let type_name = field.type_name.as_deref().ok_or_else(|| {
        QueryError::schema(context, format!("field '{}' declares no type", field.name))
    })?;

    if let Some(relation) = &field.relation {
        let target = relation.target.clone();
        let loose = relation.loose;
        return match type_name {
            "array" => {
                let item = field.items.as_deref().ok_or_else(|| {
                    QueryError::schema(context, format!("array field '{}' has no items", field.name))
                })?;
                let key = relation_key(context, dataset, item)?;
                Ok(StorageType::ManyToMany(ForeignKey { target, loose, key }))
            }
            _ => {
                let key = relation_key(context, dataset, field)?;
                Ok(StorageType::ForeignKey(ForeignKey { target, loose, key }))
            }
        };
    }

    match type_name {
        "object" => {
            let subfields = build_subfields(context, dataset, &field.subfields)?;
            Ok(StorageType::Object(subfields))
        }
        "array" => {
            let item = field.items.as_deref().ok_or_else(|| {
                QueryError::schema(context, format!("array field '{}' has no items", field.name))
            })?;
            match item.type_name.as_deref() {
                Some("object") => Ok(StorageType::NestedTable(build_subfields(
                    context,
                    dataset,
                    &item.subfields,
                )?)),
                Some("array") => Err(QueryError::schema(
                    context,
                    format!("field '{}' nests arrays, which has no storage mapping", field.name),
                )),
                _ => Ok(StorageType::Array(scalar_type(context, item)?)),
            }
        }
        _ => Ok(StorageType::Scalar(scalar_type(context, field)?)),
    }
}

fn build_subfields(
    context: &str,
    dataset: &str,
    fields: &[FieldSchema],
) -> Result<Vec<FieldDescriptor>> {
    fields
        .iter()
        .map(|f| build_field(context, dataset, f))
        .collect()
}

fn relation_key(context: &str, dataset: &str, field: &FieldSchema) -> Result<RelationKey> {
    if field.is_object() {
        if field.subfields.is_empty() {
            return Err(QueryError::schema(
                context,
                format!("relation '{}' declares no key properties", field.name),
            ));
        }
        let mut parts = build_subfields(context, dataset, &field.subfields)?;
        for part in parts.iter_mut() {
            part.is_key = true;
        }
        Ok(RelationKey::Composite(parts))
    } else {
        Ok(RelationKey::Scalar(scalar_type(context, field)?))
    }
}

fn scalar_type(context: &str, field: &FieldSchema) -> Result<ScalarType> {
    let type_name = field.type_name.as_deref().unwrap_or_default();
    let scalar = match type_name {
        "string" => match field.format.as_deref() {
            Some("date") => ScalarType::Date,
            Some("date-time") => ScalarType::DateTime,
            Some("time") => ScalarType::Time,
            Some("uuid") => ScalarType::Uuid,
            Some("uri") | Some("email") | Some("json") | None => ScalarType::Text,
            Some(other) => {
                return Err(QueryError::schema(
                    context,
                    format!("field '{}' has unsupported format '{}'", field.name, other),
                ))
            }
        },
        "integer" => ScalarType::Integer,
        "number" => ScalarType::Decimal,
        "boolean" => ScalarType::Boolean,
        other => {
            return Err(QueryError::schema(
                context,
                format!("field '{}' has unsupported type '{}'", field.name, other),
            ))
        }
    };
    Ok(scalar)
}
