use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::data::DataSpec;
use super::signal::SignalSpec;
use super::visitor::{ChartVisitor, MutChartVisitor};
use crate::error::{ChartError, Result};
use crate::graph::Scope;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkSpec {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<MarkFromSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<MarkSpec>,

    /// Encodings, scales, axes and everything else the client renders.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkFromSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub facet: Option<MarkFacetSpec>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Partitions `data` into one group instance per facet; each instance sees
/// its partition under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkFacetSpec {
    pub name: String,
    pub data: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MarkSpec {
    pub fn group() -> Self {
        Self {
            kind: "group".to_string(),
            ..Default::default()
        }
    }

    pub fn is_group(&self) -> bool {
        self.kind == "group"
    }

    pub(crate) fn walk(&self, visitor: &mut dyn ChartVisitor, scope: &Scope) -> Result<()> {
        walk_scope(&self.signals, &self.data, &self.marks, visitor, scope)
    }

    pub(crate) fn walk_mut(&mut self, visitor: &mut dyn MutChartVisitor, scope: &Scope) -> Result<()> {
        walk_scope_mut(
            &mut self.signals,
            &mut self.data,
            &mut self.marks,
            visitor,
            scope,
        )
    }

    pub fn get_group(&self, index: u32) -> Option<&MarkSpec> {
        self.marks.iter().filter(|m| m.is_group()).nth(index as usize)
    }

    pub fn get_group_mut(&mut self, index: u32) -> Option<&mut MarkSpec> {
        self.marks
            .iter_mut()
            .filter(|m| m.is_group())
            .nth(index as usize)
    }
}

/// Visit one scope's definitions, then recurse into its marks. Group marks
/// are numbered among their group siblings only.
pub(crate) fn walk_scope(
    signals: &[SignalSpec],
    data: &[DataSpec],
    marks: &[MarkSpec],
    visitor: &mut dyn ChartVisitor,
    scope: &Scope,
) -> Result<()> {
    for d in data {
        visitor.visit_data(d, scope)?;
    }
    for s in signals {
        visitor.visit_signal(s, scope)?;
    }
    let mut group_index = 0;
    for mark in marks {
        if mark.is_group() {
            let child = scope.child(group_index);
            visitor.visit_group_mark(mark, &child)?;
            mark.walk(visitor, &child)?;
            group_index += 1;
        } else {
            visitor.visit_non_group_mark(mark, scope)?;
        }
    }
    Ok(())
}

pub(crate) fn walk_scope_mut(
    signals: &mut [SignalSpec],
    data: &mut [DataSpec],
    marks: &mut [MarkSpec],
    visitor: &mut dyn MutChartVisitor,
    scope: &Scope,
) -> Result<()> {
    for d in data.iter_mut() {
        visitor.visit_data(d, scope)?;
    }
    for s in signals.iter_mut() {
        visitor.visit_signal(s, scope)?;
    }
    let mut group_index = 0;
    for mark in marks.iter_mut() {
        if mark.is_group() {
            let child = scope.child(group_index);
            visitor.visit_group_mark(mark, &child)?;
            mark.walk_mut(visitor, &child)?;
            group_index += 1;
        } else {
            visitor.visit_non_group_mark(mark, scope)?;
        }
    }
    Ok(())
}

pub(crate) fn missing_group(scope: &Scope) -> ChartError {
    ChartError::invalid_spec(format!("no group mark at scope {scope}"))
}
