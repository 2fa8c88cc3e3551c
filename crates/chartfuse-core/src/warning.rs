//! Non-fatal diagnostics returned next to every result.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningKind {
    RowLimitExceeded,
    BrokenInteractivity,
    Unsupported,
    Planner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub message: String,
}

impl Warning {
    pub fn new(kind: WarningKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn row_limit(dataset: &str, row_limit: usize) -> Self {
        Self::new(
            WarningKind::RowLimitExceeded,
            format!("Some datasets in resulting Vega specification have been truncated to the provided row limit of {row_limit}: {dataset}"),
        )
    }

    pub fn broken_interactivity(variable: impl fmt::Display) -> Self {
        Self::new(
            WarningKind::BrokenInteractivity,
            format!("Interactivity driven by {variable} was pre-evaluated and will not respond to client changes"),
        )
    }

    pub fn nothing_pre_evaluated() -> Self {
        Self::new(
            WarningKind::Unsupported,
            "Unable to pre-transform any datasets in the Vega spec",
        )
    }

    pub fn partially_supported(dataset: &str) -> Self {
        Self::new(
            WarningKind::Planner,
            format!("Some transforms applied to the '{dataset}' dataset are not yet supported"),
        )
    }

    pub fn fallback(dataset: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            WarningKind::Planner,
            format!("Transforms of the '{dataset}' dataset were evaluated by the default engine: {reason}"),
        )
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Append `incoming`, skipping warnings already present.
pub(crate) fn extend_unique(warnings: &mut Vec<Warning>, incoming: impl IntoIterator<Item = Warning>) {
    for warning in incoming {
        if !warnings.contains(&warning) {
            warnings.push(warning);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_type_tag() {
        let w = Warning::partially_supported("source_0");
        let json = serde_json::to_value(&w).unwrap();
        assert_eq!(json["type"], "Planner");
        assert!(json["message"].as_str().unwrap().contains("'source_0'"));
    }

    #[test]
    fn extend_unique_drops_duplicates() {
        let mut warnings = vec![Warning::nothing_pre_evaluated()];
        extend_unique(
            &mut warnings,
            [Warning::nothing_pre_evaluated(), Warning::row_limit("a", 3)],
        );
        assert_eq!(warnings.len(), 2);
    }
}
