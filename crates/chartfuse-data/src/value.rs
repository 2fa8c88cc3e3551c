//! Loose value semantics shared by expression evaluation, sorting, and
//! aggregation. Mirrors the coercion rules chart clients apply to JSON data.

use std::cmp::Ordering;

use serde_json::{Number, Value};

/// Numeric view of a value. Booleans count as 0/1; numeric strings parse.
pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Wrap a float as JSON; non-finite numbers become null.
pub fn number(x: f64) -> Value {
    Number::from_f64(x).map(Value::Number).unwrap_or(Value::Null)
}

/// Wrap a float, preferring an integer representation when it is integral.
pub fn integral_number(x: f64) -> Value {
    if x.is_finite() && x.fract() == 0.0 && x.abs() < 9_007_199_254_740_992.0 {
        Value::from(x as i64)
    } else {
        number(x)
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|x| x != 0.0 && !x.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Null and non-finite numbers are invalid; everything else is valid.
pub fn is_valid(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|x| !x.is_nan()),
        _ => true,
    }
}

/// Loose equality: numbers compare numerically, everything else structurally.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_))
        | (Value::Bool(_), Value::Number(_))
        | (Value::Number(_), Value::Bool(_)) => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        _ => a == b,
    }
}

/// Relational comparison used by `<`, `<=`, `>`, `>=`. Returns `None` when
/// the operands are not comparable (the comparison then evaluates to false).
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Null, _) | (_, Value::Null) => None,
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    }
}

/// Total order for sorting: nulls last, then numbers, booleans, strings, and
/// nested values by their serialized form.
pub fn sort_cmp(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Number(_) => 0,
            Value::Bool(_) => 1,
            Value::String(_) => 2,
            Value::Array(_) | Value::Object(_) => 3,
            Value::Null => 4,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_))
        | (Value::Object(_), Value::Object(_))
        | (Value::Array(_), Value::Object(_))
        | (Value::Object(_), Value::Array(_)) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// String form used for concatenation.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(x) if n.is_f64() && x.fract() == 0.0 && x.abs() < 1e21 => {
                format!("{}", x as i64)
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truthiness() {
        assert!(!truthy(&json!(null)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!("")));
        assert!(truthy(&json!("a")));
        assert!(truthy(&json!([])));
    }

    #[test]
    fn loose_equality_crosses_number_kinds() {
        assert!(loose_eq(&json!(1), &json!(1.0)));
        assert!(loose_eq(&json!("2"), &json!(2)));
        assert!(!loose_eq(&json!(null), &json!(0)));
        assert!(loose_eq(&json!(null), &json!(null)));
    }

    #[test]
    fn comparisons_with_null_are_undefined() {
        assert_eq!(compare(&json!(1), &json!(2)), Some(Ordering::Less));
        assert_eq!(compare(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare(&json!(null), &json!(2)), None);
    }

    #[test]
    fn sort_places_nulls_last() {
        let mut values = vec![json!(null), json!(3), json!("a"), json!(1)];
        values.sort_by(sort_cmp);
        assert_eq!(values, vec![json!(1), json!(3), json!("a"), json!(null)]);
    }

    #[test]
    fn integral_numbers_become_integers() {
        assert_eq!(integral_number(4.0), json!(4));
        assert_eq!(integral_number(4.5), json!(4.5));
        assert_eq!(number(f64::NAN), json!(null));
    }
}
