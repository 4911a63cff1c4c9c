//! Evaluation of predicate trees against JSON rows

use crate::MemoryTable;
use dso_query::values::parse_datetime;
use dso_query::{
    CompareOp, FieldDescriptor, FieldPath, ForeignKey, GeometryLiteral, Predicate, QueryError,
    RelationKey, Result, StorageType, TableKey, WildcardPattern, WildcardToken,
};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;

static NULL: Value = Value::Null;

/// Evaluates predicates with "any" semantics: a path that resolves to several
/// values (arrays, many-to-many relations, joins) matches when one of them does.
pub(crate) struct Evaluator<'a> {
    tables: &'a HashMap<TableKey, MemoryTable>,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(tables: &'a HashMap<TableKey, MemoryTable>) -> Self {
        Self { tables }
    }

    pub(crate) fn matches(
        &self,
        predicate: &Predicate,
        row: &Value,
        table: &MemoryTable,
    ) -> Result<bool> {
        match predicate {
            Predicate::Always => Ok(true),
            Predicate::And(parts) => {
                // conditions on one related table must hold for the same related row
                if let Some((field, fk)) = shared_join(parts, &table.descriptor.fields) {
                    let rebased: Vec<Predicate> = parts.iter().map(strip_first).collect();
                    let rebased = Predicate::And(rebased);
                    for (related, target) in self.join(row.get(&field.name).unwrap_or(&NULL), fk) {
                        if self.matches(&rebased, related, target)? {
                            return Ok(true);
                        }
                    }
                    return Ok(false);
                }
                for part in parts {
                    if !self.matches(part, row, table)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Predicate::Or(parts) => {
                for part in parts {
                    if self.matches(part, row, table)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Predicate::Not(inner) => Ok(!self.matches(inner, row, table)?),
            Predicate::Compare { path, op, value } => Ok(self
                .values(row, table, path)
                .iter()
                .any(|v| compare(v, *op, value))),
            Predicate::In { path, values } => Ok(self
                .values(row, table, path)
                .iter()
                .any(|v| values.iter().any(|candidate| compare(v, CompareOp::Eq, candidate)))),
            Predicate::IsNull { path, is_null } => {
                let null = self.values(row, table, path).iter().all(Value::is_null);
                Ok(null == *is_null)
            }
            Predicate::IsEmpty { path, is_empty } => {
                let empty = self
                    .values(row, table, path)
                    .iter()
                    .all(|v| v.is_null() || v.as_str() == Some(""));
                Ok(empty == *is_empty)
            }
            Predicate::Like { path, pattern } => {
                let regex = wildcard_regex(pattern)?;
                Ok(self
                    .values(row, table, path)
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|text| regex.is_match(text)))
            }
            Predicate::ArrayContains { path, value } => Ok(self
                .values(row, table, path)
                .iter()
                .filter_map(Value::as_array)
                .any(|items| items.iter().any(|item| compare(item, CompareOp::Eq, value)))),
            Predicate::GeoContains { path, geometry } => {
                let Some(point) = literal_point(geometry) else {
                    return Ok(false);
                };
                Ok(self
                    .values(row, table, path)
                    .iter()
                    .any(|g| contains_point(g, point)))
            }
            Predicate::GeoEquals { path, geometry } => Ok(self
                .values(row, table, path)
                .iter()
                .any(|g| geometry_equals(g, geometry))),
            Predicate::LatestVersion {
                identifier,
                version,
            } => Ok(self.is_latest_version(row, table, identifier, version)),
        }
    }

    /// Every value found at `path`; missing values are `null`
    pub(crate) fn values(&self, row: &Value, table: &MemoryTable, path: &FieldPath) -> Vec<Value> {
        self.values_at(row, &table.descriptor.fields, path.segments())
    }

    fn values_at(&self, row: &Value, fields: &[FieldDescriptor], segments: &[String]) -> Vec<Value> {
        let Some((name, rest)) = segments.split_first() else {
            return vec![row.clone()];
        };
        let value = row.get(name).unwrap_or(&NULL);
        let storage = fields.iter().find(|f| &f.name == name).map(|f| &f.storage);

        if rest.is_empty() {
            return match (storage, value) {
                (Some(StorageType::ManyToMany(_)), Value::Array(items)) => items.clone(),
                _ => vec![value.clone()],
            };
        }

        match storage {
            Some(StorageType::Object(subfields)) | Some(StorageType::NestedTable(subfields)) => {
                objects(value)
                    .into_iter()
                    .flat_map(|object| self.values_at(object, subfields, rest))
                    .collect()
            }
            Some(StorageType::ForeignKey(fk)) | Some(StorageType::ManyToMany(fk)) => {
                if rest.len() == 1 && fk.component(&rest[0]).is_some() {
                    objects(value)
                        .into_iter()
                        .map(|object| object.get(&rest[0]).cloned().unwrap_or(Value::Null))
                        .collect()
                } else {
                    self.join(value, fk)
                        .into_iter()
                        .flat_map(|(related, target)| {
                            self.values_at(related, &target.descriptor.fields, rest)
                        })
                        .collect()
                }
            }
            _ => Vec::new(),
        }
    }

    /// Rows of the related table referenced by a relation value
    fn join(&self, value: &Value, fk: &ForeignKey) -> Vec<(&'a Value, &'a MemoryTable)> {
        let Some(target) = self.tables.get(&fk.target) else {
            return Vec::new();
        };
        let references: Vec<&Value> = match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        let mut joined = Vec::new();
        for reference in references {
            for row in target.rows.iter() {
                if references_row(fk, reference, row, &target.descriptor.identifier) {
                    joined.push((row, target));
                }
            }
        }
        joined
    }

    fn is_latest_version(
        &self,
        row: &Value,
        table: &MemoryTable,
        identifier: &FieldPath,
        version: &FieldPath,
    ) -> bool {
        let (Some((id_field, prefix)), Some(version_field)) =
            (identifier.segments().split_last(), version.segments().last())
        else {
            return false;
        };

        let mut candidates: Vec<(&Value, &MemoryTable)> = vec![(row, table)];
        for segment in prefix {
            candidates = candidates
                .into_iter()
                .flat_map(|(r, t)| {
                    match t.descriptor.field(segment).and_then(|f| f.storage.relation()) {
                        Some(fk) => self.join(r.get(segment).unwrap_or(&NULL), fk),
                        None => Vec::new(),
                    }
                })
                .collect();
        }

        candidates.into_iter().any(|(candidate, t)| {
            let id = candidate.get(id_field);
            let Some(own) = candidate.get(version_field) else {
                return false;
            };
            let latest = t
                .rows
                .iter()
                .filter(|other| other.get(id_field) == id)
                .filter_map(|other| other.get(version_field))
                .max_by(|a, b| order_values(a, b));
            latest == Some(own)
        })
    }
}

/// The relation field all parts of a conjunction traverse, if they share one
fn shared_join<'f>(
    parts: &[Predicate],
    fields: &'f [FieldDescriptor],
) -> Option<(&'f FieldDescriptor, &'f ForeignKey)> {
    let mut paths = Vec::new();
    for part in parts {
        if !collect_paths(part, &mut paths) {
            return None;
        }
    }
    let first = paths.first()?.segments().first()?;
    let field = fields.iter().find(|f| &f.name == first)?;
    let fk = field.storage.relation()?;
    let all_joined = paths.iter().all(|path| {
        let segments = path.segments();
        segments.len() >= 2
            && &segments[0] == first
            && !(segments.len() == 2 && fk.component(&segments[1]).is_some())
    });
    all_joined.then_some((field, fk))
}

/// Leaf paths of a predicate; false when one of them cannot be rebased
fn collect_paths<'p>(predicate: &'p Predicate, paths: &mut Vec<&'p FieldPath>) -> bool {
    match predicate {
        Predicate::Always => true,
        Predicate::And(parts) | Predicate::Or(parts) => {
            parts.iter().all(|p| collect_paths(p, paths))
        }
        Predicate::Not(inner) => collect_paths(inner, paths),
        Predicate::LatestVersion {
            identifier,
            version,
        } => {
            paths.push(identifier);
            paths.push(version);
            true
        }
        Predicate::Compare { path, .. }
        | Predicate::In { path, .. }
        | Predicate::IsNull { path, .. }
        | Predicate::IsEmpty { path, .. }
        | Predicate::Like { path, .. }
        | Predicate::ArrayContains { path, .. }
        | Predicate::GeoContains { path, .. }
        | Predicate::GeoEquals { path, .. } => {
            paths.push(path);
            true
        }
    }
}

/// Same predicate with the first segment of every path removed
fn strip_first(predicate: &Predicate) -> Predicate {
    let rebase = |path: &FieldPath| FieldPath::new(path.segments().iter().skip(1).cloned());
    match predicate {
        Predicate::Always => Predicate::Always,
        Predicate::And(parts) => Predicate::And(parts.iter().map(strip_first).collect()),
        Predicate::Or(parts) => Predicate::Or(parts.iter().map(strip_first).collect()),
        Predicate::Not(inner) => strip_first(inner).negate(),
        Predicate::Compare { path, op, value } => Predicate::Compare {
            path: rebase(path),
            op: *op,
            value: value.clone(),
        },
        Predicate::In { path, values } => Predicate::In {
            path: rebase(path),
            values: values.clone(),
        },
        Predicate::IsNull { path, is_null } => Predicate::IsNull {
            path: rebase(path),
            is_null: *is_null,
        },
        Predicate::IsEmpty { path, is_empty } => Predicate::IsEmpty {
            path: rebase(path),
            is_empty: *is_empty,
        },
        Predicate::Like { path, pattern } => Predicate::Like {
            path: rebase(path),
            pattern: pattern.clone(),
        },
        Predicate::ArrayContains { path, value } => Predicate::ArrayContains {
            path: rebase(path),
            value: value.clone(),
        },
        Predicate::GeoContains { path, geometry } => Predicate::GeoContains {
            path: rebase(path),
            geometry: geometry.clone(),
        },
        Predicate::GeoEquals { path, geometry } => Predicate::GeoEquals {
            path: rebase(path),
            geometry: geometry.clone(),
        },
        Predicate::LatestVersion {
            identifier,
            version,
        } => Predicate::LatestVersion {
            identifier: rebase(identifier),
            version: rebase(version),
        },
    }
}

fn objects(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().filter(|v| v.is_object()).collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    }
}

fn references_row(fk: &ForeignKey, reference: &Value, row: &Value, identifier: &str) -> bool {
    match &fk.key {
        RelationKey::Scalar(_) => row
            .get(identifier)
            .is_some_and(|id| compare(id, CompareOp::Eq, reference)),
        RelationKey::Composite(parts) => {
            let parts = if fk.loose { &parts[..1] } else { &parts[..] };
            parts.iter().all(|part| {
                match (reference.get(&part.name), row.get(&part.name)) {
                    (Some(wanted), Some(actual)) => compare(actual, CompareOp::Eq, wanted),
                    _ => false,
                }
            })
        }
    }
}

fn compare(value: &Value, op: CompareOp, literal: &Value) -> bool {
    if value.is_null() || literal.is_null() {
        return false;
    }
    let Some(ordering) = compare_values(value, literal) else {
        return false;
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Lte => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Gte => ordering != Ordering::Less,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_datetime(x), parse_datetime(y)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => (a == b).then_some(Ordering::Equal),
    }
}

/// Total order for sorting; `null` sorts first
pub(crate) fn order_values(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare_values(a, b).unwrap_or(Ordering::Equal),
    }
}

fn wildcard_regex(pattern: &WildcardPattern) -> Result<Regex> {
    let mut source = String::from("(?s)^");
    for token in pattern.tokens() {
        match token {
            WildcardToken::Literal(text) => source.push_str(&regex::escape(text)),
            WildcardToken::AnyRun => source.push_str(".*"),
            WildcardToken::AnyChar => source.push('.'),
        }
    }
    source.push('$');
    Regex::new(&source).map_err(|e| QueryError::backend(format!("invalid pattern: {}", e)))
}

fn literal_point(geometry: &GeometryLiteral) -> Option<(f64, f64)> {
    match geometry {
        GeometryLiteral::Point { x, y } => Some((*x, *y)),
        GeometryLiteral::GeoJson(value) => match value.get("type").and_then(Value::as_str) {
            Some("Point") => coordinate(value.get("coordinates")?),
            _ => None,
        },
        GeometryLiteral::Wkt(text) => {
            let inner = text
                .trim()
                .strip_prefix("POINT")?
                .trim()
                .strip_prefix('(')?
                .strip_suffix(')')?;
            let mut parts = inner.split_whitespace().map(str::parse::<f64>);
            Some((parts.next()?.ok()?, parts.next()?.ok()?))
        }
    }
}

fn coordinate(value: &Value) -> Option<(f64, f64)> {
    Some((value.get(0)?.as_f64()?, value.get(1)?.as_f64()?))
}

fn contains_point(geometry: &Value, point: (f64, f64)) -> bool {
    let coordinates = geometry.get("coordinates");
    match (geometry.get("type").and_then(Value::as_str), coordinates) {
        (Some("Point"), Some(c)) => coordinate(c) == Some(point),
        (Some("Polygon"), Some(rings)) => polygon_contains(rings, point),
        (Some("MultiPolygon"), Some(Value::Array(polygons))) => {
            polygons.iter().any(|rings| polygon_contains(rings, point))
        }
        _ => false,
    }
}

fn polygon_contains(rings: &Value, point: (f64, f64)) -> bool {
    let Some(rings) = rings.as_array() else {
        return false;
    };
    let Some((exterior, holes)) = rings.split_first() else {
        return false;
    };
    ring_contains(exterior, point) && !holes.iter().any(|hole| ring_contains(hole, point))
}

/// Even-odd ray casting
fn ring_contains(ring: &Value, (x, y): (f64, f64)) -> bool {
    let points: Vec<(f64, f64)> = ring
        .as_array()
        .map(|r| r.iter().filter_map(coordinate).collect())
        .unwrap_or_default();
    let n = points.len();
    let mut inside = false;
    for i in 0..n {
        let (xi, yi) = points[i];
        let (xj, yj) = points[(i + n - 1) % n];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
    }
    inside
}

fn geometry_equals(value: &Value, geometry: &GeometryLiteral) -> bool {
    match geometry {
        GeometryLiteral::GeoJson(literal) => value == literal,
        GeometryLiteral::Point { .. } | GeometryLiteral::Wkt(_) => {
            value.get("type").and_then(Value::as_str) == Some("Point")
                && literal_point(geometry).is_some_and(|p| contains_point(value, p))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wildcards_are_case_sensitive() {
        let regex = wildcard_regex(&WildcardPattern::parse("Oost*").unwrap()).unwrap();
        assert!(regex.is_match("Oosterpark"));
        assert!(!regex.is_match("oosterpark"));

        let regex = wildcard_regex(&WildcardPattern::parse(r"a?c\*").unwrap()).unwrap();
        assert!(regex.is_match("abc*"));
        assert!(!regex.is_match("abcd"));
    }

    #[test]
    fn test_compare_dates_and_numbers() {
        assert!(compare(&json!("2021-01-01"), CompareOp::Lt, &json!("2021-06-01")));
        assert!(compare(
            &json!("2021-06-01T10:00:00+02:00"),
            CompareOp::Eq,
            &json!("2021-06-01T08:00:00Z")
        ));
        assert!(compare(&json!(2), CompareOp::Gte, &json!(2.0)));
        assert!(!compare(&Value::Null, CompareOp::Eq, &Value::Null));
        assert_eq!(order_values(&Value::Null, &json!(1)), Ordering::Less);
    }

    #[test]
    fn test_point_in_polygon() {
        let square = json!({
            "type": "Polygon",
            "coordinates": [
                [[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]],
                [[4.0, 4.0], [6.0, 4.0], [6.0, 6.0], [4.0, 6.0], [4.0, 4.0]]
            ]
        });
        assert!(contains_point(&square, (1.0, 1.0)));
        assert!(!contains_point(&square, (5.0, 5.0)));
        assert!(!contains_point(&square, (11.0, 1.0)));
        assert_eq!(
            literal_point(&GeometryLiteral::Wkt("POINT (1.5 2)".to_string())),
            Some((1.5, 2.0))
        );
    }
}
