//! Backend-agnostic query description.
//!
//! The filter engine and temporal resolver only describe which records to
//! select; a [`crate::traits::QueryExecutor`] turns a [`QuerySpec`] into
//! whatever its storage understands.

use crate::model::EntityTypeDescriptor;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Dotted path from the queried table to a (possibly related) field
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn join(&self, name: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.into());
        Self(segments)
    }

    /// Re-root this path below `prefix`
    pub fn under(&self, prefix: &FieldPath) -> Self {
        let mut segments = prefix.0.clone();
        segments.extend(self.0.iter().cloned());
        Self(segments)
    }

    /// Path in the `relation__field` notation used by ORM-style backends
    pub fn to_backend_path(&self) -> String {
        self.0.join("__")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CompareOp {
    Eq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WildcardToken {
    Literal(String),
    /// `*`: any run of characters, possibly empty
    AnyRun,
    /// `?`: exactly one character
    AnyChar,
}

/// Case-sensitive glob pattern with `\` escaping `*`, `?` and `\`
#[derive(Debug, Clone, PartialEq)]
pub struct WildcardPattern {
    tokens: Vec<WildcardToken>,
}

impl WildcardPattern {
    pub fn parse(pattern: &str) -> std::result::Result<Self, String> {
        let mut tokens = Vec::new();
        let mut literal = String::new();
        let mut chars = pattern.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped @ ('*' | '?' | '\\')) => literal.push(escaped),
                    Some(other) => {
                        return Err(format!("invalid escape sequence '\\{}'", other));
                    }
                    None => return Err("pattern ends with an escape character".to_string()),
                },
                '*' | '?' => {
                    if !literal.is_empty() {
                        tokens.push(WildcardToken::Literal(std::mem::take(&mut literal)));
                    }
                    tokens.push(if c == '*' {
                        WildcardToken::AnyRun
                    } else {
                        WildcardToken::AnyChar
                    });
                }
                _ => literal.push(c),
            }
        }
        if !literal.is_empty() {
            tokens.push(WildcardToken::Literal(literal));
        }
        Ok(Self { tokens })
    }

    pub fn tokens(&self) -> &[WildcardToken] {
        &self.tokens
    }

    pub fn has_wildcards(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| !matches!(t, WildcardToken::Literal(_)))
    }

    /// SQL `LIKE` pattern using `\` as escape character
    pub fn to_sql_like(&self) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            match token {
                WildcardToken::AnyRun => out.push('%'),
                WildcardToken::AnyChar => out.push('_'),
                WildcardToken::Literal(text) => {
                    for c in text.chars() {
                        if matches!(c, '%' | '_' | '\\') {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                }
            }
        }
        out
    }
}

/// Geometry operand of a spatial lookup
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryLiteral {
    Point { x: f64, y: f64 },
    GeoJson(Value),
    Wkt(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Matches everything
    Always,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        path: FieldPath,
        op: CompareOp,
        value: Value,
    },
    In {
        path: FieldPath,
        values: Vec<Value>,
    },
    IsNull {
        path: FieldPath,
        is_null: bool,
    },
    /// Text is (not) the empty string
    IsEmpty {
        path: FieldPath,
        is_empty: bool,
    },
    Like {
        path: FieldPath,
        pattern: WildcardPattern,
    },
    /// Array field holds the value
    ArrayContains {
        path: FieldPath,
        value: Value,
    },
    GeoContains {
        path: FieldPath,
        geometry: GeometryLiteral,
    },
    GeoEquals {
        path: FieldPath,
        geometry: GeometryLiteral,
    },
    /// Row holds the highest version among rows sharing its identifier
    LatestVersion {
        identifier: FieldPath,
        version: FieldPath,
    },
}

impl Predicate {
    /// Conjunction that flattens nested `And`s and drops `Always`
    pub fn and(predicates: Vec<Predicate>) -> Predicate {
        let mut flat = Vec::with_capacity(predicates.len());
        for predicate in predicates {
            match predicate {
                Predicate::Always => {}
                Predicate::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Predicate::Always,
            1 => flat.remove(0),
            _ => Predicate::And(flat),
        }
    }

    pub fn compare(path: FieldPath, op: CompareOp, value: Value) -> Predicate {
        Predicate::Compare { path, op, value }
    }

    pub fn eq(path: FieldPath, value: Value) -> Predicate {
        Predicate::compare(path, CompareOp::Eq, value)
    }

    /// `start <= value AND (end IS NULL OR value < end)`
    pub fn within_range(start: FieldPath, end: FieldPath, value: Value) -> Predicate {
        Predicate::And(vec![
            Predicate::compare(start, CompareOp::Lte, value.clone()),
            Predicate::Or(vec![
                Predicate::IsNull {
                    path: end.clone(),
                    is_null: true,
                },
                Predicate::compare(end, CompareOp::Gt, value),
            ]),
        ])
    }

    pub fn negate(self) -> Predicate {
        Predicate::Not(Box::new(self))
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Predicate::Always)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SortKey {
    pub path: FieldPath,
    pub descending: bool,
}

impl SortKey {
    pub fn asc(path: FieldPath) -> Self {
        Self {
            path,
            descending: false,
        }
    }

    pub fn desc(path: FieldPath) -> Self {
        Self {
            path,
            descending: true,
        }
    }
}

/// Keep the first row per distinct key combination under `order`
#[derive(Debug, Clone, PartialEq)]
pub struct DistinctOn {
    pub keys: Vec<FieldPath>,
    pub order: Vec<SortKey>,
}

/// Complete description of one backend query
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub table: Arc<EntityTypeDescriptor>,
    pub predicate: Predicate,
    /// Applied before `ordering`, `offset` and `limit`
    pub distinct_on: Option<DistinctOn>,
    pub ordering: Vec<SortKey>,
    pub offset: usize,
    pub limit: Option<usize>,
}

/// Accumulates predicates and ordering for one table
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    table: Arc<EntityTypeDescriptor>,
    predicates: Vec<Predicate>,
    distinct_on: Option<DistinctOn>,
    ordering: Vec<SortKey>,
    offset: usize,
    limit: Option<usize>,
}

impl QueryBuilder {
    pub fn new(table: Arc<EntityTypeDescriptor>) -> Self {
        Self {
            table,
            predicates: Vec::new(),
            distinct_on: None,
            ordering: Vec::new(),
            offset: 0,
            limit: None,
        }
    }

    pub fn table(&self) -> &Arc<EntityTypeDescriptor> {
        &self.table
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        if !predicate.is_always() {
            self.predicates.push(predicate);
        }
        self
    }

    /// Append sort keys after the ones already present
    pub fn order_by(mut self, keys: impl IntoIterator<Item = SortKey>) -> Self {
        for key in keys {
            if !self.ordering.iter().any(|k| k.path == key.path) {
                self.ordering.push(key);
            }
        }
        self
    }

    pub fn distinct_on(mut self, distinct: DistinctOn) -> Self {
        self.distinct_on = Some(distinct);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn ordering(&self) -> &[SortKey] {
        &self.ordering
    }

    pub fn build(self) -> QuerySpec {
        QuerySpec {
            table: self.table,
            predicate: Predicate::and(self.predicates),
            distinct_on: self.distinct_on,
            ordering: self.ordering,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wildcard_tokens_and_escapes() {
        let pattern = WildcardPattern::parse(r"Dam*str?at\*").unwrap();
        assert_eq!(
            pattern.tokens(),
            &[
                WildcardToken::Literal("Dam".into()),
                WildcardToken::AnyRun,
                WildcardToken::Literal("str".into()),
                WildcardToken::AnyChar,
                WildcardToken::Literal("at*".into()),
            ]
        );
        assert!(pattern.has_wildcards());
    }

    #[test]
    fn test_wildcard_sql_like() {
        let pattern = WildcardPattern::parse(r"100%_*\?").unwrap();
        assert_eq!(pattern.to_sql_like(), r"100\%\_%?");
    }

    #[test]
    fn test_wildcard_rejects_dangling_escape() {
        assert!(WildcardPattern::parse("abc\\").is_err());
        assert!(WildcardPattern::parse("a\\b").is_err());
    }

    #[test]
    fn test_and_flattens() {
        let a = Predicate::eq(FieldPath::field("a"), json!(1));
        let b = Predicate::eq(FieldPath::field("b"), json!(2));
        let combined = Predicate::and(vec![
            Predicate::Always,
            Predicate::And(vec![a.clone()]),
            b.clone(),
        ]);
        assert_eq!(combined, Predicate::And(vec![a.clone(), b]));
        assert_eq!(Predicate::and(vec![a.clone()]), a);
        assert_eq!(Predicate::and(vec![]), Predicate::Always);
    }

    #[test]
    fn test_field_path_rendering() {
        let path = FieldPath::field("ligtInWijk").join("identificatie");
        assert_eq!(path.to_string(), "ligtInWijk.identificatie");
        assert_eq!(path.to_backend_path(), "ligtInWijk__identificatie");
        assert_eq!(
            FieldPath::field("x").under(&FieldPath::field("rel")),
            FieldPath::new(["rel", "x"])
        );
    }
}
