//! Evaluated node values.

use chartfuse_data::Table;
use serde_json::Value;

use crate::error::{ChartError, Result};
use crate::warning::Warning;

/// The value of one signal or dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskValue {
    Scalar(Value),
    Table(Table),
}

impl TaskValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            TaskValue::Scalar(v) => Some(v),
            TaskValue::Table(_) => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            TaskValue::Table(t) => Some(t),
            TaskValue::Scalar(_) => None,
        }
    }

    pub fn into_table(self) -> Result<Table> {
        match self {
            TaskValue::Table(t) => Ok(t),
            TaskValue::Scalar(v) => Err(ChartError::internal(format!(
                "expected a table, found scalar {v}"
            ))),
        }
    }

    /// JSON form sent to clients: scalars as-is, tables as arrays of rows.
    pub fn to_json(&self) -> Value {
        match self {
            TaskValue::Scalar(v) => v.clone(),
            TaskValue::Table(t) => t.to_json(),
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            TaskValue::Scalar(v) => v.to_string().len(),
            TaskValue::Table(t) => t.size_of(),
        }
    }
}

/// Everything produced by evaluating one node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeValue {
    pub value: TaskValue,
    /// Signals published by the node's transforms, in pipeline order.
    pub outputs: Vec<TaskValue>,
    /// Diagnostics raised while computing the value; cached alongside it.
    pub warnings: Vec<Warning>,
}

impl NodeValue {
    pub fn scalar(value: Value) -> Self {
        Self {
            value: TaskValue::Scalar(value),
            outputs: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn table(table: Table) -> Self {
        Self {
            value: TaskValue::Table(table),
            outputs: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn size_of(&self) -> usize {
        self.value.size_of() + self.outputs.iter().map(TaskValue::size_of).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn size_includes_outputs() {
        let table = Table::from_json(&json!([{"a": 1}, {"a": 2}])).unwrap();
        let mut value = NodeValue::table(table.clone());
        let base = value.size_of();
        assert_eq!(base, table.size_of());
        value.outputs.push(TaskValue::Scalar(json!([1, 2])));
        assert!(value.size_of() > base);
    }

    #[test]
    fn scalar_is_not_a_table() {
        assert!(TaskValue::Scalar(json!(1)).into_table().is_err());
        assert_eq!(TaskValue::Scalar(json!("x")).to_json(), json!("x"));
    }
}
