use crate::error::{QueryError, Result};
use crate::model::{EntityTypeDescriptor, ForeignKey, RelationKey, StorageType};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A row of data as key-value pairs, as handed over by backends
pub type DataRow = HashMap<String, Value>;

/// Canonical, hashable identity of an entity or a reference to one.
///
/// Scalar identifiers use their plain value; composite keys join their
/// components with `.` (`"03630000000001.2"`).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_parts(parts: &[&Value]) -> Option<Self> {
        let mut rendered = Vec::with_capacity(parts.len());
        for part in parts {
            rendered.push(render_scalar(part)?);
        }
        Some(Self(rendered.join(".")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render a scalar JSON value the way it appears in an identifier
pub fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// A record of any table, read through its descriptor.
///
/// Records are produced by backends; the core only reads them.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    descriptor: Arc<EntityTypeDescriptor>,
    values: Vec<Value>,
}

impl EntityRecord {
    /// Build a record from a backend row; absent fields become `null`
    pub fn from_row(descriptor: Arc<EntityTypeDescriptor>, mut row: DataRow) -> Self {
        let values = descriptor
            .fields
            .iter()
            .map(|f| row.remove(&f.name).unwrap_or(Value::Null))
            .collect();
        Self { descriptor, values }
    }

    /// Build a record from positional values; the length must match the descriptor
    pub fn from_values(descriptor: Arc<EntityTypeDescriptor>, values: Vec<Value>) -> Result<Self> {
        if values.len() != descriptor.fields.len() {
            return Err(QueryError::invariant(format!(
                "{} expects {} values, got {}",
                descriptor.key,
                descriptor.fields.len(),
                values.len()
            )));
        }
        Ok(Self { descriptor, values })
    }

    pub fn descriptor(&self) -> &Arc<EntityTypeDescriptor> {
        &self.descriptor
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.descriptor
            .field_index(name)
            .map(|i| &self.values[i])
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Identity of the logical entity (version excluded)
    pub fn object_id(&self) -> Option<ObjectId> {
        ObjectId::from_parts(&[self.get(&self.descriptor.identifier)?])
    }

    /// Identity of this exact row (identifier plus version for temporal tables)
    pub fn primary_key(&self) -> Option<ObjectId> {
        let parts: Option<Vec<&Value>> = self
            .descriptor
            .primary_key
            .iter()
            .map(|name| self.get(name))
            .collect();
        ObjectId::from_parts(&parts?)
    }

    /// Identities of the records referenced by a relation field, in order.
    ///
    /// Loose relations reference the logical identifier only; composite
    /// relations reference the full primary key of the target.
    pub fn references(&self, field: &str) -> Vec<ObjectId> {
        let Some(descriptor) = self.descriptor.field(field) else {
            return Vec::new();
        };
        let Some(value) = self.get(field) else {
            return Vec::new();
        };
        match &descriptor.storage {
            StorageType::ForeignKey(fk) => reference_id(fk, value).into_iter().collect(),
            StorageType::ManyToMany(fk) => match value {
                Value::Array(items) => items.iter().filter_map(|v| reference_id(fk, v)).collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .descriptor
            .fields
            .iter()
            .zip(self.values.iter())
            .map(|(f, v)| (f.name.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

fn reference_id(fk: &ForeignKey, value: &Value) -> Option<ObjectId> {
    match (&fk.key, value) {
        (_, Value::Null) => None,
        (RelationKey::Scalar(_), v) => ObjectId::from_parts(&[v]),
        (RelationKey::Composite(parts), Value::Object(map)) => {
            let names: Vec<&str> = if fk.loose {
                parts.iter().take(1).map(|p| p.name.as_str()).collect()
            } else {
                parts.iter().map(|p| p.name.as_str()).collect()
            };
            let values: Option<Vec<&Value>> = names
                .iter()
                .map(|n| map.get(*n).filter(|v| !v.is_null()))
                .collect();
            ObjectId::from_parts(&values?)
        }
        (RelationKey::Composite(_), _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityModelFactory;
    use crate::schema::DatasetSchema;
    use serde_json::json;

    fn descriptor() -> Arc<EntityTypeDescriptor> {
        let dataset = DatasetSchema::from_value(json!({
            "id": "d",
            "tables": [{
                "id": "t",
                "schema": {
                    "properties": {
                        "id": {"type": "integer"},
                        "pand": {
                            "type": "object",
                            "relation": "d:panden",
                            "properties": {
                                "identificatie": {"type": "string"},
                                "volgnummer": {"type": "integer"}
                            }
                        },
                        "buurten": {"type": "array", "relation": "d:buurten", "items": {"type": "integer"}}
                    }
                }
            }]
        }))
        .unwrap();
        Arc::new(EntityModelFactory::build(dataset.table("t").unwrap(), &dataset).unwrap())
    }

    #[test]
    fn test_field_access_by_name_and_index() {
        let mut row = DataRow::new();
        row.insert("id".to_string(), json!(4));
        let record = EntityRecord::from_row(descriptor(), row);

        assert_eq!(record.get("id"), Some(&json!(4)));
        assert_eq!(record.get_index(0), Some(&json!(4)));
        assert_eq!(record.get("pand"), Some(&Value::Null));
        assert_eq!(record.get("missing"), None);
        assert_eq!(record.object_id(), Some(ObjectId::new("4")));
    }

    #[test]
    fn test_references_keep_order() {
        let mut row = DataRow::new();
        row.insert("id".to_string(), json!(1));
        row.insert(
            "pand".to_string(),
            json!({"identificatie": "0363", "volgnummer": 2}),
        );
        row.insert("buurten".to_string(), json!([5, 7, 5]));
        let record = EntityRecord::from_row(descriptor(), row);

        assert_eq!(record.references("pand"), vec![ObjectId::new("0363.2")]);
        assert_eq!(
            record.references("buurten"),
            vec![ObjectId::new("5"), ObjectId::new("7"), ObjectId::new("5")]
        );
        assert!(record.references("id").is_empty());
    }

    #[test]
    fn test_from_values_checks_arity() {
        assert!(EntityRecord::from_values(descriptor(), vec![json!(1)]).is_err());
    }
}
