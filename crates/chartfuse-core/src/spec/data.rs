use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::transform::TransformSpec;
use super::values::{OneOrMany, StringOrSignal};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSpec {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<OneOrMany<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<StringOrSignal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transform: Vec<TransformSpec>,

    /// Client-side insert/remove triggers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DataSpec {
    /// A dataset with only a name and, optionally, inline values.
    pub fn stub(name: impl Into<String>, values: Option<Value>) -> Self {
        Self {
            name: name.into(),
            values,
            ..Default::default()
        }
    }

    /// The single parent dataset, if this dataset derives from exactly one.
    pub fn single_source(&self) -> Option<&str> {
        match &self.source {
            Some(OneOrMany::One(name)) => Some(name),
            Some(OneOrMany::Many(names)) if names.len() == 1 => Some(&names[0]),
            _ => None,
        }
    }

    pub fn sources(&self) -> Vec<String> {
        self.source.as_ref().map(|s| s.to_vec()).unwrap_or_default()
    }

    /// URL as a literal string (signal-valued URLs return `None`).
    pub fn url_str(&self) -> Option<&str> {
        match &self.url {
            Some(StringOrSignal::String(url)) => Some(url),
            _ => None,
        }
    }

    /// The format `type`, when given.
    pub fn format_type(&self) -> Option<&str> {
        self.format
            .as_ref()
            .and_then(|f| f.get("type"))
            .and_then(Value::as_str)
    }

    /// Inline values with nothing else to compute.
    pub fn is_values_only(&self) -> bool {
        self.values.is_some()
            && self.transform.is_empty()
            && self.source.is_none()
            && self.url.is_none()
            && self.on.is_none()
    }

    /// Drop everything but the name; the content is supplied from elsewhere.
    pub fn clear_definition(&mut self) {
        self.source = None;
        self.url = None;
        self.format = None;
        self.values = None;
        self.transform.clear();
        self.on = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn url_and_source_helpers() {
        let data: DataSpec = serde_json::from_value(json!({
            "name": "order_items",
            "url": "table://order_items",
            "format": {"type": "json"}
        }))
        .unwrap();
        assert_eq!(data.url_str(), Some("table://order_items"));
        assert_eq!(data.format_type(), Some("json"));

        let child: DataSpec =
            serde_json::from_value(json!({"name": "c", "source": ["a", "b"]})).unwrap();
        assert_eq!(child.single_source(), None);
        assert_eq!(child.sources(), vec!["a", "b"]);
    }

    #[test]
    fn clear_keeps_name_and_extras() {
        let mut data: DataSpec = serde_json::from_value(json!({
            "name": "source_0",
            "values": [{"a": 1}],
            "transform": [{"type": "filter", "expr": "datum.a > 0"}],
            "async": true
        }))
        .unwrap();
        data.clear_definition();
        assert_eq!(
            serde_json::to_value(&data).unwrap(),
            json!({"name": "source_0", "async": true})
        );
    }
}
