//! Column types and table schemas.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DataError, DataResult};

/// Logical column type.
///
/// `Json` covers columns whose values are nested or of mixed kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Boolean,
    Integer,
    Float,
    Utf8,
    Json,
}

impl DataType {
    /// Type of a single JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => DataType::Null,
            Value::Bool(_) => DataType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DataType::Integer,
            Value::Number(_) => DataType::Float,
            Value::String(_) => DataType::Utf8,
            Value::Array(_) | Value::Object(_) => DataType::Json,
        }
    }

    /// Widen two observed types into one that can hold both.
    pub fn merge(self, other: DataType) -> DataType {
        use DataType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Null, t) | (t, Null) => t,
            (Integer, Float) | (Float, Integer) => Float,
            _ => Json,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Integer | DataType::Float)
    }

    /// Whether a column of type `self` can stand in for `other`.
    pub fn is_compatible_with(self, other: DataType) -> bool {
        self == other
            || self == DataType::Null
            || other == DataType::Null
            || (self.is_numeric() && other.is_numeric())
    }

    /// Generic SQL type name used when rendering casts.
    pub fn sql_name(self) -> &'static str {
        match self {
            DataType::Null => "NULL",
            DataType::Boolean => "BOOLEAN",
            DataType::Integer => "BIGINT",
            DataType::Float => "DOUBLE",
            DataType::Utf8 | DataType::Json => "VARCHAR",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Null => "null",
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Utf8 => "utf8",
            DataType::Json => "json",
        };
        f.write_str(name)
    }
}

/// A named column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

/// Ordered list of fields describing a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn data_type(&self, name: &str) -> Option<DataType> {
        self.field(name).map(|f| f.data_type)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Append a field, replacing an existing field of the same name in place.
    pub fn with_field(mut self, field: Field) -> Self {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => self.fields.push(field),
        }
        self
    }

    /// Verify that `actual` can be used where `self` was expected.
    ///
    /// Field names must match in order; types must be compatible
    /// (see [`DataType::is_compatible_with`]).
    pub fn check_compatible(&self, actual: &Schema) -> DataResult<()> {
        let mismatch = || DataError::SchemaMismatch {
            expected: self.to_string(),
            actual: actual.to_string(),
        };
        if self.fields.len() != actual.fields.len() {
            return Err(mismatch());
        }
        for (expected, got) in self.fields.iter().zip(actual.fields.iter()) {
            if expected.name != got.name || !expected.data_type.is_compatible_with(got.data_type)
            {
                return Err(mismatch());
            }
        }
        Ok(())
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", field.name, field.data_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_of_json_values() {
        assert_eq!(DataType::of(&json!(1)), DataType::Integer);
        assert_eq!(DataType::of(&json!(1.5)), DataType::Float);
        assert_eq!(DataType::of(&json!("a")), DataType::Utf8);
        assert_eq!(DataType::of(&json!(null)), DataType::Null);
        assert_eq!(DataType::of(&json!([1])), DataType::Json);
    }

    #[test]
    fn merge_widens() {
        assert_eq!(DataType::Integer.merge(DataType::Float), DataType::Float);
        assert_eq!(DataType::Null.merge(DataType::Utf8), DataType::Utf8);
        assert_eq!(DataType::Utf8.merge(DataType::Integer), DataType::Json);
    }

    #[test]
    fn compatible_schemas() {
        let expected = Schema::new(vec![
            Field::new("menu_item", DataType::Integer),
            Field::new("count", DataType::Integer),
        ]);
        let actual = Schema::new(vec![
            Field::new("menu_item", DataType::Float),
            Field::new("count", DataType::Null),
        ]);
        assert!(expected.check_compatible(&actual).is_ok());
    }

    #[test]
    fn mismatched_schemas() {
        let expected = Schema::new(vec![Field::new("a", DataType::Integer)]);
        let renamed = Schema::new(vec![Field::new("b", DataType::Integer)]);
        let retyped = Schema::new(vec![Field::new("a", DataType::Utf8)]);
        assert!(matches!(
            expected.check_compatible(&renamed),
            Err(DataError::SchemaMismatch { .. })
        ));
        assert!(expected.check_compatible(&retyped).is_err());
        assert!(expected.check_compatible(&Schema::empty()).is_err());
    }

    #[test]
    fn with_field_replaces_in_place() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Integer),
            Field::new("b", DataType::Utf8),
        ])
        .with_field(Field::new("a", DataType::Float))
        .with_field(Field::new("c", DataType::Boolean));
        assert_eq!(schema.names().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(schema.data_type("a"), Some(DataType::Float));
    }
}
