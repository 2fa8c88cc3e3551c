//! Small value shapes shared by signal, data, and transform definitions.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

/// `{"signal": "<expression>"}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRef {
    pub signal: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrSignal {
    String(String),
    Signal(SignalRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrSignal {
    Number(Number),
    Signal(SignalRef),
}

impl NumberOrSignal {
    pub fn number(&self) -> Option<f64> {
        match self {
            NumberOrSignal::Number(n) => n.as_f64(),
            NumberOrSignal::Signal(_) => None,
        }
    }

    pub fn signal(&self) -> Option<&str> {
        match self {
            NumberOrSignal::Signal(r) => Some(&r.signal),
            NumberOrSignal::Number(_) => None,
        }
    }
}

/// One or many strings, e.g. a multi-source dataset or a sort field list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> OneOrMany<T> {
    pub fn to_vec(&self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v.clone()],
            OneOrMany::Many(vs) => vs.clone(),
        }
    }
}

/// Keep an explicit `null` as `Some(Value::Null)` so it survives a round trip.
pub(crate) fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn number_or_signal_accepts_both() {
        let n: NumberOrSignal = serde_json::from_value(json!(5)).unwrap();
        assert_eq!(n.number(), Some(5.0));
        let s: NumberOrSignal = serde_json::from_value(json!({"signal": "maxbins"})).unwrap();
        assert_eq!(s.signal(), Some("maxbins"));
    }

    #[test]
    fn one_or_many_flattens() {
        let one: OneOrMany<String> = serde_json::from_value(json!("a")).unwrap();
        let many: OneOrMany<String> = serde_json::from_value(json!(["a", "b"])).unwrap();
        assert_eq!(one.to_vec(), vec!["a"]);
        assert_eq!(many.to_vec(), vec!["a", "b"]);
    }
}
