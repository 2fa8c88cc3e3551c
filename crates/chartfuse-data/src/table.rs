//! Materialized tables.
//!
//! A [`Table`] is a schema plus rows of JSON objects. Rows live behind an
//! `Arc`, so cloning a table (into the cache, into a connection's registry,
//! into a response) never copies row data.

use std::sync::Arc;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{DataError, DataResult};
use crate::schema::{DataType, Field, Schema};

/// One table row keyed by column name.
pub type Row = Map<String, Value>;

const ROW_OVERHEAD: usize = 48;
const VALUE_OVERHEAD: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    schema: Schema,
    rows: Arc<Vec<Row>>,
}

impl Table {
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        Self {
            schema,
            rows: Arc::new(rows),
        }
    }

    pub fn empty(schema: Schema) -> Self {
        Self::new(schema, Vec::new())
    }

    /// Build a table, inferring its schema from the rows.
    ///
    /// Fields are ordered by first appearance; types widen across rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let schema = infer_schema(&rows);
        Self::new(schema, rows)
    }

    /// Parse a JSON array of objects.
    pub fn from_json(value: &Value) -> DataResult<Self> {
        let items = value
            .as_array()
            .ok_or_else(|| DataError::InvalidData("expected a JSON array of objects".into()))?;
        let mut rows = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match item {
                Value::Object(obj) => rows.push(obj.clone()),
                other => {
                    return Err(DataError::InvalidData(format!(
                        "row {i} is not an object: {other}"
                    )))
                }
            }
        }
        Ok(Self::from_rows(rows))
    }

    pub fn to_json(&self) -> Value {
        Value::Array(self.rows.iter().cloned().map(Value::Object).collect())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Replace the schema while keeping the rows.
    pub fn with_schema(&self, schema: Schema) -> Self {
        Self {
            schema,
            rows: Arc::clone(&self.rows),
        }
    }

    /// First `n` rows.
    pub fn head(&self, n: usize) -> Self {
        if n >= self.rows.len() {
            return self.clone();
        }
        Self::new(self.schema.clone(), self.rows[..n].to_vec())
    }

    /// Values of one column; absent keys read as null.
    pub fn column<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(name).unwrap_or(&Value::Null))
    }

    /// Estimated in-memory size in bytes.
    pub fn size_of(&self) -> usize {
        let fields: usize = self.schema.names().map(|n| n.len() + VALUE_OVERHEAD).sum();
        let rows: usize = self
            .rows
            .iter()
            .map(|row| {
                ROW_OVERHEAD
                    + row
                        .iter()
                        .map(|(k, v)| k.len() + value_size(v))
                        .sum::<usize>()
            })
            .sum();
        fields + rows
    }

    /// SHA-256 over the schema and the row contents, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for field in self.schema.fields() {
            hasher.update(field.name.as_bytes());
            hasher.update([0u8]);
            hasher.update(field.data_type.to_string().as_bytes());
            hasher.update([0u8]);
        }
        hasher.update([1u8]);
        for row in self.rows.iter() {
            for (key, value) in row {
                hasher.update(key.as_bytes());
                hasher.update([0u8]);
                hasher.update(value.to_string().as_bytes());
                hasher.update([0u8]);
            }
            hasher.update([1u8]);
        }
        hex::encode(hasher.finalize())
    }
}

pub(crate) fn infer_schema(rows: &[Row]) -> Schema {
    let mut fields: Vec<Field> = Vec::new();
    for row in rows {
        for (name, value) in row {
            let observed = DataType::of(value);
            match fields.iter_mut().find(|f| &f.name == name) {
                Some(field) => field.data_type = field.data_type.merge(observed),
                None => fields.push(Field::new(name.clone(), observed)),
            }
        }
    }
    Schema::new(fields)
}

fn value_size(value: &Value) -> usize {
    VALUE_OVERHEAD
        + match value {
            Value::Null | Value::Bool(_) | Value::Number(_) => 0,
            Value::String(s) => s.len(),
            Value::Array(items) => items.iter().map(value_size).sum(),
            Value::Object(obj) => obj.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
        }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Table {
        Table::from_json(&json!([
            {"a": 1, "b": "x"},
            {"a": 2.5, "c": true},
            {"a": null, "b": "y"}
        ]))
        .unwrap()
    }

    #[test]
    fn infers_schema_in_first_appearance_order() {
        let table = sample();
        let names: Vec<_> = table.schema().names().collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(table.schema().data_type("a"), Some(DataType::Float));
        assert_eq!(table.schema().data_type("b"), Some(DataType::Utf8));
        assert_eq!(table.schema().data_type("c"), Some(DataType::Boolean));
        assert_eq!(table.num_rows(), 3);
    }

    #[test]
    fn rejects_non_object_rows() {
        let err = Table::from_json(&json!([{"a": 1}, 2])).unwrap_err();
        assert!(matches!(err, DataError::InvalidData(_)));
        assert!(Table::from_json(&json!({"a": 1})).is_err());
    }

    #[test]
    fn head_truncates() {
        let table = sample();
        assert_eq!(table.head(2).num_rows(), 2);
        assert_eq!(table.head(10).num_rows(), 3);
        assert_eq!(table.head(0).num_rows(), 0);
    }

    #[test]
    fn column_reads_missing_as_null() {
        let table = sample();
        let c: Vec<_> = table.column("c").cloned().collect();
        assert_eq!(c, vec![json!(null), json!(true), json!(null)]);
    }

    #[test]
    fn fingerprint_is_content_addressed() {
        let a = sample();
        let b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);

        let c = Table::from_json(&json!([{"a": 1, "b": "x"}])).unwrap();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn size_grows_with_rows() {
        let small = Table::from_json(&json!([{"a": "hello"}])).unwrap();
        let large = Table::from_json(&json!([{"a": "hello"}, {"a": "world"}])).unwrap();
        assert!(large.size_of() > small.size_of());
    }
}
