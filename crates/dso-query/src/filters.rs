//! Filter expression parsing and the authorization gate.
//!
//! A filter key has the form `field`, `field[lookup]` or a dotted path
//! through relations and objects (`ligtInWijk.naam[like]`). Every step is
//! resolved against the entity model and checked against the caller's
//! scopes before a backend predicate is produced.

use crate::config::QueryConfig;
use crate::error::{QueryError, Result};
use crate::model::{
    EntityTypeDescriptor, FieldDescriptor, ForeignKey, GeometryKind, ModelLookup, RelationKey,
    ScalarType, StorageType,
};
use crate::params::QueryParams;
use crate::predicate::{
    CompareOp, FieldPath, GeometryLiteral, Predicate, SortKey, WildcardPattern,
};
use crate::scopes::{Access, FilterScope};
use crate::temporal::TemporalTableQuery;
use crate::values::{parse_bool, parse_scalar, Instant};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Lookup {
    Exact,
    Not,
    IsNull,
    IsEmpty,
    Like,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Contains,
}

impl Lookup {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "exact" => Lookup::Exact,
            "not" => Lookup::Not,
            "isnull" => Lookup::IsNull,
            "isempty" => Lookup::IsEmpty,
            "like" => Lookup::Like,
            "lt" => Lookup::Lt,
            "lte" => Lookup::Lte,
            "gt" => Lookup::Gt,
            "gte" => Lookup::Gte,
            "in" => Lookup::In,
            "contains" => Lookup::Contains,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::Not => "not",
            Lookup::IsNull => "isnull",
            Lookup::IsEmpty => "isempty",
            Lookup::Like => "like",
            Lookup::Lt => "lt",
            Lookup::Lte => "lte",
            Lookup::Gt => "gt",
            Lookup::Gte => "gte",
            Lookup::In => "in",
            Lookup::Contains => "contains",
        }
    }

    /// Accepts repeated parameters and comma-separated lists
    pub fn is_multi_value(self) -> bool {
        matches!(self, Lookup::In | Lookup::Not)
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of value a resolved filter path ends in
#[derive(Debug, Clone, PartialEq)]
pub enum FilterTarget {
    Scalar(ScalarType),
    /// Identifier of a table, or a key component of a relation
    Identifier(ScalarType),
    Relation(ForeignKey),
    Geometry(GeometryKind),
    Array(ScalarType),
}

impl FilterTarget {
    pub fn allowed_lookups(&self) -> Vec<Lookup> {
        use Lookup::*;
        match self {
            FilterTarget::Scalar(scalar) => scalar_lookups(*scalar).to_vec(),
            FilterTarget::Identifier(scalar) => {
                let mut lookups = vec![Exact, In, Not, IsNull];
                for lookup in scalar_lookups(*scalar) {
                    if !lookups.contains(lookup) {
                        lookups.push(*lookup);
                    }
                }
                lookups
            }
            FilterTarget::Relation(_) => vec![Exact, In, Not, IsNull],
            FilterTarget::Geometry(_) => vec![Exact, Contains, IsNull, Not],
            FilterTarget::Array(_) => vec![Contains],
        }
    }

    fn is_sortable(&self) -> bool {
        matches!(self, FilterTarget::Scalar(_) | FilterTarget::Identifier(_))
    }
}

fn scalar_lookups(scalar: ScalarType) -> &'static [Lookup] {
    use Lookup::*;
    match scalar {
        ScalarType::Text => &[Exact, Not, IsNull, IsEmpty, Like],
        ScalarType::Boolean => &[Exact, IsNull],
        ScalarType::Uuid => &[Exact, Not, IsNull, In],
        ScalarType::Integer
        | ScalarType::Decimal
        | ScalarType::Date
        | ScalarType::DateTime
        | ScalarType::Time => &[Exact, Lt, Lte, Gt, Gte, Not, IsNull, In],
    }
}

/// A validated and authorized filter key
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFilter {
    /// The request parameter this filter came from, e.g. `naam[like]`
    pub key: String,
    pub path: FieldPath,
    pub lookup: Lookup,
    pub target: FilterTarget,
    /// Versioned tables joined on their identifier alone, outermost first.
    /// Each is restricted to the version valid for the request.
    pub joins: Vec<(FieldPath, Arc<EntityTypeDescriptor>)>,
}

impl ParsedFilter {
    /// Backend predicate for the given raw parameter values
    pub fn to_predicate(&self, raw_values: &[&str]) -> Result<Predicate> {
        let values: Vec<&str> = if self.lookup.is_multi_value() {
            raw_values
                .iter()
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .collect()
        } else {
            if raw_values.len() > 1 {
                return Err(QueryError::validation(
                    &self.key,
                    "parameter given more than once",
                ));
            }
            raw_values.to_vec()
        };
        let Some(&first) = values.first() else {
            return Err(QueryError::validation(&self.key, "no value given"));
        };

        match self.lookup {
            Lookup::IsNull => Ok(Predicate::IsNull {
                path: self.path.clone(),
                is_null: self.parse_flag(first)?,
            }),
            Lookup::IsEmpty => Ok(Predicate::IsEmpty {
                path: self.path.clone(),
                is_empty: self.parse_flag(first)?,
            }),
            Lookup::Like => {
                let pattern = WildcardPattern::parse(first)
                    .map_err(|msg| QueryError::validation(&self.key, msg))?;
                Ok(Predicate::Like {
                    path: self.path.clone(),
                    pattern,
                })
            }
            Lookup::Contains => match &self.target {
                FilterTarget::Array(item) => Ok(Predicate::ArrayContains {
                    path: self.path.clone(),
                    value: self.parse_value(*item, first)?,
                }),
                FilterTarget::Geometry(_) => Ok(Predicate::GeoContains {
                    path: self.path.clone(),
                    geometry: self.parse_geometry(first)?,
                }),
                _ => Err(self.unsupported()),
            },
            Lookup::Exact => self.equals(first),
            Lookup::In => {
                let mut simple = Vec::with_capacity(values.len());
                let mut compound = Vec::new();
                for raw in &values {
                    match self.equals(raw)? {
                        Predicate::Compare { value, .. } if compound.is_empty() => simple.push(value),
                        other => compound.push(other),
                    }
                }
                if compound.is_empty() {
                    Ok(Predicate::In {
                        path: self.equality_path(),
                        values: simple,
                    })
                } else {
                    let mut alternatives: Vec<Predicate> = simple
                        .into_iter()
                        .map(|v| Predicate::eq(self.equality_path(), v))
                        .collect();
                    alternatives.extend(compound);
                    Ok(Predicate::Or(alternatives))
                }
            }
            Lookup::Not => {
                let mut excluded = Vec::with_capacity(values.len());
                for raw in &values {
                    excluded.push(self.equals(raw)?);
                }
                let inner = if excluded.len() == 1 {
                    excluded.remove(0)
                } else {
                    Predicate::Or(excluded)
                };
                Ok(inner.negate())
            }
            Lookup::Lt | Lookup::Lte | Lookup::Gt | Lookup::Gte => {
                let op = match self.lookup {
                    Lookup::Lt => CompareOp::Lt,
                    Lookup::Lte => CompareOp::Lte,
                    Lookup::Gt => CompareOp::Gt,
                    _ => CompareOp::Gte,
                };
                let scalar = self.scalar_type().ok_or_else(|| self.unsupported())?;
                Ok(Predicate::compare(
                    self.path.clone(),
                    op,
                    self.parse_value(scalar, first)?,
                ))
            }
        }
    }

    fn equals(&self, raw: &str) -> Result<Predicate> {
        match &self.target {
            FilterTarget::Geometry(_) => Ok(Predicate::GeoEquals {
                path: self.path.clone(),
                geometry: self.parse_geometry(raw)?,
            }),
            FilterTarget::Relation(fk) => match &fk.key {
                RelationKey::Scalar(scalar) => {
                    Ok(Predicate::eq(self.path.clone(), self.parse_value(*scalar, raw)?))
                }
                RelationKey::Composite(parts) => {
                    let split: Vec<&str> = if fk.loose {
                        vec![raw]
                    } else {
                        raw.splitn(parts.len(), '.').collect()
                    };
                    let mut predicates = Vec::with_capacity(split.len());
                    for (part, value) in parts.iter().zip(split) {
                        let scalar = part.storage.scalar().ok_or_else(|| self.unsupported())?;
                        predicates.push(Predicate::eq(
                            self.path.join(&part.name),
                            self.parse_value(scalar, value)?,
                        ));
                    }
                    Ok(Predicate::and(predicates))
                }
            },
            _ => {
                let scalar = self.scalar_type().ok_or_else(|| self.unsupported())?;
                Ok(Predicate::eq(self.path.clone(), self.parse_value(scalar, raw)?))
            }
        }
    }

    /// Path compared by a plain equality on this target
    fn equality_path(&self) -> FieldPath {
        match &self.target {
            FilterTarget::Relation(ForeignKey {
                key: RelationKey::Composite(parts),
                ..
            }) => self.path.join(&parts[0].name),
            _ => self.path.clone(),
        }
    }

    fn scalar_type(&self) -> Option<ScalarType> {
        match &self.target {
            FilterTarget::Scalar(s) | FilterTarget::Identifier(s) => Some(*s),
            _ => None,
        }
    }

    fn parse_value(&self, scalar: ScalarType, raw: &str) -> Result<Value> {
        parse_scalar(scalar, raw).map_err(|msg| QueryError::validation(&self.key, msg))
    }

    fn parse_flag(&self, raw: &str) -> Result<bool> {
        parse_bool(raw.trim()).ok_or_else(|| {
            QueryError::validation(&self.key, format!("'{}' is not a boolean", raw))
        })
    }

    fn parse_geometry(&self, raw: &str) -> Result<GeometryLiteral> {
        parse_geometry(raw).ok_or_else(|| {
            QueryError::validation(
                &self.key,
                format!("'{}' is not an 'x,y' point or a geometry literal", raw),
            )
        })
    }

    fn unsupported(&self) -> QueryError {
        QueryError::validation(
            &self.key,
            format!("lookup '{}' is not supported for this field", self.lookup),
        )
    }
}

/// Accepts `x,y`, a GeoJSON geometry object, or WKT
pub fn parse_geometry(raw: &str) -> Option<GeometryLiteral> {
    let raw = raw.trim();
    if let Some((x, y)) = raw.split_once(',') {
        if let (Ok(x), Ok(y)) = (x.trim().parse::<f64>(), y.trim().parse::<f64>()) {
            if x.is_finite() && y.is_finite() {
                return Some(GeometryLiteral::Point { x, y });
            }
        }
    }
    if raw.starts_with('{') {
        let value: Value = serde_json::from_str(raw).ok()?;
        return value
            .get("type")
            .and_then(Value::as_str)
            .is_some()
            .then_some(GeometryLiteral::GeoJson(value));
    }
    let keyword: String = raw.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    const WKT_TYPES: [&str; 7] = [
        "POINT",
        "MULTIPOINT",
        "LINESTRING",
        "MULTILINESTRING",
        "POLYGON",
        "MULTIPOLYGON",
        "GEOMETRYCOLLECTION",
    ];
    let rest = raw[keyword.len()..].trim_start();
    (WKT_TYPES.contains(&keyword.to_ascii_uppercase().as_str()) && rest.starts_with('('))
        .then(|| GeometryLiteral::Wkt(raw.to_string()))
}

/// Parses filter and sort parameters for one request
pub struct FilterEngine<'a> {
    models: &'a dyn ModelLookup,
    scopes: &'a FilterScope,
    config: &'a QueryConfig,
    temporal: Option<&'a TemporalTableQuery>,
}

struct Resolved {
    path: FieldPath,
    target: FilterTarget,
    joins: Vec<(FieldPath, Arc<EntityTypeDescriptor>)>,
}

impl<'a> FilterEngine<'a> {
    pub fn new(models: &'a dyn ModelLookup, scopes: &'a FilterScope, config: &'a QueryConfig) -> Self {
        Self {
            models,
            scopes,
            config,
            temporal: None,
        }
    }

    /// Slice versioned tables reached through relations the same way as `query`
    pub fn with_temporal(mut self, query: &'a TemporalTableQuery) -> Self {
        self.temporal = Some(query);
        self
    }

    /// Resolve and authorize a single filter key such as `ligtInWijk.naam[like]`
    pub fn parse(&self, key: &str, table: &EntityTypeDescriptor) -> Result<ParsedFilter> {
        let (name, lookup) = split_lookup(key)?;
        let segments: Vec<&str> = name.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(QueryError::validation(key, "empty field name"));
        }

        let resolved = self.resolve(key, table, &table.fields, &segments, None, true)?;
        let lookup = lookup.unwrap_or(Lookup::Exact);
        if !resolved.target.allowed_lookups().contains(&lookup) {
            return Err(QueryError::validation(
                key,
                format!("lookup '{}' is not supported for field '{}'", lookup, name),
            ));
        }

        Ok(ParsedFilter {
            key: key.to_string(),
            path: resolved.path,
            lookup,
            target: resolved.target,
            joins: resolved.joins,
        })
    }

    /// Combined predicate for every filter parameter of the request.
    ///
    /// Reserved parameters and the table's temporal parameters are skipped;
    /// they are consumed by paging, sorting, embedding and the temporal resolver.
    pub fn build(&self, params: &QueryParams, table: &EntityTypeDescriptor) -> Result<Predicate> {
        let mut predicates = Vec::new();
        // kept apart so the validity condition stays on the same related row
        let mut correlated = Vec::new();

        for key in params.keys() {
            if self.config.params.is_reserved(key) || is_temporal_param(table, key) {
                continue;
            }
            let values = params.get_all(key);

            if let Some((name, range)) = table.additional_filters.iter().find(|(n, _)| n == key) {
                predicates.push(self.range_filter(name, &range.start, &range.end, table, &values)?);
                continue;
            }

            let filter = self.parse(key, table)?;
            let predicate = filter.to_predicate(&values)?;
            match self.restrict_joins(predicate, &filter.joins)? {
                (predicate, true) => correlated.push(predicate),
                (predicate, false) => predicates.push(predicate),
            }
        }

        let mut parts = match Predicate::and(predicates) {
            Predicate::Always => Vec::new(),
            Predicate::And(parts) => parts,
            other => vec![other],
        };
        parts.extend(correlated);
        let predicate = match parts.len() {
            0 => Predicate::Always,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        };
        debug!("Filters for {}: {:?}", table.key, predicate);
        Ok(predicate)
    }

    /// Wrap `predicate` with the validity condition of every joined versioned table,
    /// innermost join first. The flag tells whether anything was added.
    fn restrict_joins(
        &self,
        mut predicate: Predicate,
        joins: &[(FieldPath, Arc<EntityTypeDescriptor>)],
    ) -> Result<(Predicate, bool)> {
        let Some(temporal) = self.temporal else {
            return Ok((predicate, false));
        };
        let mut restricted = false;
        for (prefix, target) in joins.iter().rev() {
            let related = temporal.for_related(target, self.config);
            if let Some(valid) = related.related_predicate(prefix, target)? {
                predicate = Predicate::And(vec![predicate, valid]);
                restricted = true;
            }
        }
        Ok((predicate, restricted))
    }

    /// Sort keys from a `-a,b` list; descending when prefixed with `-`
    pub fn parse_sort(&self, raw: &str, table: &EntityTypeDescriptor) -> Result<Vec<SortKey>> {
        let param = self.config.params.sort.as_str();
        let mut keys = Vec::new();
        for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, descending) = match item.strip_prefix('-') {
                Some(name) => (name, true),
                None => (item, false),
            };
            let segments: Vec<&str> = name.split('.').collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(QueryError::validation(param, format!("invalid sort field '{}'", item)));
            }
            let resolved = self.resolve(param, table, &table.fields, &segments, None, true)?;
            if !resolved.target.is_sortable() {
                return Err(QueryError::validation(
                    param,
                    format!("cannot sort on '{}'", name),
                ));
            }
            keys.push(SortKey {
                path: resolved.path,
                descending,
            });
        }
        Ok(keys)
    }

    fn range_filter(
        &self,
        name: &str,
        start: &str,
        end: &str,
        table: &EntityTypeDescriptor,
        values: &[&str],
    ) -> Result<Predicate> {
        for field_name in [start, end] {
            if let Some(field) = table.field(field_name) {
                self.authorize_field(field, &FieldPath::field(field_name))?;
            }
        }
        let [raw] = values else {
            return Err(QueryError::validation(name, "parameter given more than once"));
        };
        let scalar = table
            .field(start)
            .and_then(|f| f.storage.scalar())
            .unwrap_or(ScalarType::Date);
        let value = if scalar.is_temporal() {
            Instant::parse(raw)
                .map(|i| i.to_value(scalar))
                .ok_or_else(|| QueryError::validation(name, format!("'{}' is not a valid date", raw)))?
        } else {
            parse_scalar(scalar, raw).map_err(|msg| QueryError::validation(name, msg))?
        };
        Ok(Predicate::within_range(
            FieldPath::field(start),
            FieldPath::field(end),
            value,
        ))
    }

    fn resolve(
        &self,
        key: &str,
        table: &EntityTypeDescriptor,
        fields: &[FieldDescriptor],
        segments: &[&str],
        parent: Option<FieldPath>,
        table_root: bool,
    ) -> Result<Resolved> {
        let Some((name, rest)) = segments.split_first() else {
            return Err(QueryError::validation(key, "empty field name"));
        };
        let field = fields.iter().find(|f| f.name == *name).ok_or_else(|| {
            QueryError::validation(key, format!("unknown field '{}' on {}", name, table.key))
        })?;
        let path = match parent {
            Some(parent) => parent.join(*name),
            None => FieldPath::field(*name),
        };
        self.authorize_field(field, &path)?;

        match &field.storage {
            StorageType::ForeignKey(fk) | StorageType::ManyToMany(fk) => {
                if rest.is_empty() {
                    Ok(Resolved {
                        path,
                        target: FilterTarget::Relation(fk.clone()),
                        joins: Vec::new(),
                    })
                } else {
                    self.traverse(key, fk, rest, path)
                }
            }
            StorageType::Object(subfields) | StorageType::NestedTable(subfields) => {
                if rest.is_empty() {
                    return Err(QueryError::validation(
                        key,
                        format!("'{}' is an object; filter on one of its fields", path),
                    ));
                }
                self.resolve(key, table, subfields, rest, Some(path), false)
            }
            storage => {
                if !rest.is_empty() {
                    return Err(QueryError::validation(
                        key,
                        format!("'{}' has no fields to traverse", path),
                    ));
                }
                let target = match storage {
                    StorageType::Scalar(scalar) if table_root && field.name == table.identifier => {
                        FilterTarget::Identifier(*scalar)
                    }
                    StorageType::Scalar(scalar) => FilterTarget::Scalar(*scalar),
                    StorageType::Geometry(kind) => FilterTarget::Geometry(*kind),
                    StorageType::Array(item) => FilterTarget::Array(*item),
                    _ => {
                        return Err(QueryError::invariant(format!(
                            "unexpected storage for '{}'",
                            path
                        )))
                    }
                };
                Ok(Resolved {
                    path,
                    target,
                    joins: Vec::new(),
                })
            }
        }
    }

    fn traverse(
        &self,
        key: &str,
        fk: &ForeignKey,
        rest: &[&str],
        path: FieldPath,
    ) -> Result<Resolved> {
        let target = self.models.model(&fk.target);
        if let Some(target) = target {
            self.authorize_table(target, &path)?;
        }
        let next = rest[0];

        if fk.loose {
            let identifier = match (&fk.key, target) {
                (RelationKey::Composite(parts), _) => parts[0].name.as_str(),
                (RelationKey::Scalar(_), Some(target)) => target.identifier.as_str(),
                (RelationKey::Scalar(_), None) => {
                    return Err(QueryError::validation(
                        key,
                        format!("related table {} is not available", fk.target),
                    ))
                }
            };
            if rest.len() != 1 || next != identifier {
                return Err(QueryError::validation(
                    key,
                    format!(
                        "'{}' is matched by value; only '{}.{}' can be filtered",
                        path, path, identifier
                    ),
                ));
            }
            return self.local_key(fk, target, path, next);
        }

        if rest.len() == 1 {
            let local = match &fk.key {
                RelationKey::Composite(_) => fk.component(next).is_some(),
                RelationKey::Scalar(_) => target.is_some_and(|t| t.identifier == next),
            };
            if local {
                return self.local_key(fk, target, path, next);
            }
        }

        let target = target.ok_or_else(|| {
            QueryError::validation(key, format!("related table {} is not available", fk.target))
        })?;
        // a key without the version component matches every version of the target
        let unpinned = target
            .version_field()
            .is_some_and(|version| fk.component(version).is_none());
        let mut resolved = self.resolve(key, target, &target.fields, rest, Some(path.clone()), true)?;
        if unpinned {
            resolved.joins.insert(0, (path, target.clone()));
        }
        Ok(resolved)
    }

    /// A key component stored on the referencing side of a relation
    fn local_key(
        &self,
        fk: &ForeignKey,
        target: Option<&Arc<EntityTypeDescriptor>>,
        path: FieldPath,
        component: &str,
    ) -> Result<Resolved> {
        let component_path = path.join(component);
        if let Some(field) = target.and_then(|t| t.field(component)) {
            self.authorize_field(field, &component_path)?;
        }
        match &fk.key {
            RelationKey::Scalar(scalar) => Ok(Resolved {
                path,
                target: FilterTarget::Identifier(*scalar),
                joins: Vec::new(),
            }),
            RelationKey::Composite(_) => {
                let part = fk.component(component).ok_or_else(|| {
                    QueryError::invariant(format!("'{}' is not a key component", component_path))
                })?;
                self.authorize_field(part, &component_path)?;
                let scalar = part.storage.scalar().ok_or_else(|| {
                    QueryError::invariant(format!("'{}' is not a scalar", component_path))
                })?;
                Ok(Resolved {
                    path: component_path,
                    target: FilterTarget::Identifier(scalar),
                    joins: Vec::new(),
                })
            }
        }
    }

    fn authorize_field(&self, field: &FieldDescriptor, path: &FieldPath) -> Result<()> {
        match field.auth.evaluate(self.scopes) {
            Access::Denied => Err(QueryError::permission_denied(
                path.to_string(),
                format!("field requires scope {}", field.auth),
            )),
            Access::Granted | Access::NotRequired => Ok(()),
        }
    }

    fn authorize_table(&self, target: &EntityTypeDescriptor, relation: &FieldPath) -> Result<()> {
        for requirement in [&target.dataset_auth, &target.table_auth] {
            if requirement.evaluate(self.scopes) == Access::Denied {
                return Err(QueryError::permission_denied(
                    relation.to_string(),
                    format!("related table {} requires scope {}", target.key, requirement),
                ));
            }
        }
        Ok(())
    }
}

fn split_lookup(key: &str) -> Result<(&str, Option<Lookup>)> {
    let Some(open) = key.find('[') else {
        return Ok((key, None));
    };
    let name = &key[..open];
    let lookup = key[open + 1..]
        .strip_suffix(']')
        .ok_or_else(|| QueryError::validation(key, "malformed lookup, expected 'field[lookup]'"))?;
    let lookup = Lookup::parse(lookup)
        .ok_or_else(|| QueryError::validation(key, format!("unknown lookup '{}'", lookup)))?;
    if name.is_empty() {
        return Err(QueryError::validation(key, "empty field name"));
    }
    Ok((name, Some(lookup)))
}

fn is_temporal_param(table: &EntityTypeDescriptor, key: &str) -> bool {
    table.temporal.as_ref().is_some_and(|t| {
        t.version_field == key || t.dimensions.iter().any(|(name, _)| name == key)
    })
}
