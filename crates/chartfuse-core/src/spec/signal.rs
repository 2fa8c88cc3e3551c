use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::values::present;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub name: String,

    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub init: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,

    /// Event handlers; kept as raw JSON since only the client runs them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on: Vec<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<Value>,

    /// `"outer"` marks a reference to a signal of an enclosing scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SignalSpec {
    /// A signal holding a fixed value.
    pub fn literal(name: impl Into<String>, value: Option<Value>) -> Self {
        Self {
            name: name.into(),
            value,
            ..Default::default()
        }
    }

    /// Whether this entry defines a signal rather than referencing an outer one.
    pub fn is_definition(&self) -> bool {
        self.push.as_deref() != Some("outer")
    }

    /// Driven by user interaction on the client.
    pub fn is_interactive(&self) -> bool {
        !self.on.is_empty() || self.bind.is_some()
    }

    /// The expression that computes the signal, `update` taking precedence.
    pub fn expression(&self) -> Option<&str> {
        self.update.as_deref().or(self.init.as_deref())
    }

    /// Only a fixed value: no expression and no interaction.
    pub fn is_literal(&self) -> bool {
        self.expression().is_none() && !self.is_interactive()
    }
}
