//! Arrow kernels behind the default engine's orderings.
//!
//! Sort keys are lowered to typed Arrow arrays and ordered with
//! `lexsort_to_indices`; the rows themselves are then permuted in place of
//! a round trip through a record batch, so values keep their exact JSON
//! form. Keys holding nested or mixed values have no Arrow equivalent and
//! use the row comparator instead.

use std::cmp::Ordering;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt64Array};
use arrow::compute::{lexsort_to_indices, SortColumn, SortOptions};
use serde_json::Value;

use crate::error::DataResult;
use crate::query::{SortKey, SortOrder};
use crate::table::Row;
use crate::value::sort_cmp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Null,
    Boolean,
    Integer,
    Float,
    Utf8,
}

fn key_kind<'a>(values: impl Iterator<Item = &'a Value>) -> Option<KeyKind> {
    let mut kind = KeyKind::Null;
    for value in values {
        let observed = match value {
            Value::Null => continue,
            Value::Bool(_) => KeyKind::Boolean,
            Value::Number(n) if n.is_i64() => KeyKind::Integer,
            Value::Number(_) => KeyKind::Float,
            Value::String(_) => KeyKind::Utf8,
            Value::Array(_) | Value::Object(_) => return None,
        };
        kind = match (kind, observed) {
            (KeyKind::Null, k) => k,
            (a, b) if a == b => a,
            (KeyKind::Integer, KeyKind::Float) | (KeyKind::Float, KeyKind::Integer) => {
                KeyKind::Float
            }
            _ => return None,
        };
    }
    Some(kind)
}

/// Typed Arrow column for one sort key, or `None` when the values mix kinds.
fn key_array(rows: &[Row], subset: &[usize], field: &str) -> Option<ArrayRef> {
    let values = || subset.iter().map(|&i| rows[i].get(field).unwrap_or(&Value::Null));
    let array: ArrayRef = match key_kind(values())? {
        // all null: every row ties on this key
        KeyKind::Null | KeyKind::Integer => {
            Arc::new(values().map(Value::as_i64).collect::<Int64Array>())
        }
        KeyKind::Float => Arc::new(values().map(Value::as_f64).collect::<Float64Array>()),
        KeyKind::Boolean => Arc::new(values().map(Value::as_bool).collect::<BooleanArray>()),
        KeyKind::Utf8 => Arc::new(values().map(Value::as_str).collect::<StringArray>()),
    };
    Some(array)
}

/// Stable ordering of `subset` (indices into `rows`) by `keys`.
///
/// Ascending keys place nulls last, descending keys place them first.
/// Ties keep their order in `subset`.
pub(crate) fn sort_permutation(
    rows: &[Row],
    subset: &[usize],
    keys: &[SortKey],
) -> DataResult<Vec<usize>> {
    if keys.is_empty() || subset.len() < 2 {
        return Ok(subset.to_vec());
    }

    let mut columns = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        let Some(values) = key_array(rows, subset, &key.field) else {
            return Ok(row_permutation(rows, subset, keys));
        };
        let descending = key.order == SortOrder::Descending;
        columns.push(SortColumn {
            values,
            options: Some(SortOptions {
                descending,
                nulls_first: descending,
            }),
        });
    }
    // position tiebreak keeps the sort stable
    columns.push(SortColumn {
        values: Arc::new(UInt64Array::from_iter_values(0..subset.len() as u64)),
        options: None,
    });

    let indices = lexsort_to_indices(&columns, None)?;
    Ok(indices
        .values()
        .iter()
        .map(|&i| subset[i as usize])
        .collect())
}

/// Compare two rows on `keys` with the loose row ordering.
pub(crate) fn compare_rows(a: &Row, b: &Row, keys: &[SortKey]) -> Ordering {
    for key in keys {
        let va = a.get(&key.field).unwrap_or(&Value::Null);
        let vb = b.get(&key.field).unwrap_or(&Value::Null);
        let ord = match key.order {
            SortOrder::Ascending => sort_cmp(va, vb),
            SortOrder::Descending => sort_cmp(va, vb).reverse(),
        };
        if ord.is_ne() {
            return ord;
        }
    }
    Ordering::Equal
}

fn row_permutation(rows: &[Row], subset: &[usize], keys: &[SortKey]) -> Vec<usize> {
    let mut out = subset.to_vec();
    out.sort_by(|&a, &b| compare_rows(&rows[a], &rows[b], keys));
    out
}
