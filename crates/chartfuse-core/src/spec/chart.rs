use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::data::DataSpec;
use super::mark::{missing_group, walk_scope, walk_scope_mut, MarkSpec};
use super::signal::SignalSpec;
use super::visitor::{ChartVisitor, MutChartVisitor};
use crate::error::{ChartError, Result};
use crate::graph::Scope;

/// A declarative chart document: signals, datasets and marks, with every
/// property this crate does not interpret kept in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartSpec {
    #[serde(rename = "$schema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signals: Vec<SignalSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<MarkSpec>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChartSpec {
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| ChartError::invalid_spec(e.to_string()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| ChartError::invalid_spec(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn walk(&self, visitor: &mut dyn ChartVisitor) -> Result<()> {
        walk_scope(&self.signals, &self.data, &self.marks, visitor, &Scope::root())
    }

    pub fn walk_mut(&mut self, visitor: &mut dyn MutChartVisitor) -> Result<()> {
        walk_scope_mut(
            &mut self.signals,
            &mut self.data,
            &mut self.marks,
            visitor,
            &Scope::root(),
        )
    }

    pub fn get_nested_group(&self, scope: &Scope) -> Result<&MarkSpec> {
        let (first, rest) = scope
            .as_slice()
            .split_first()
            .ok_or_else(|| ChartError::internal("the root scope is not a group"))?;
        let mut group = self
            .marks
            .iter()
            .filter(|m| m.is_group())
            .nth(*first as usize)
            .ok_or_else(|| missing_group(scope))?;
        for index in rest {
            group = group.get_group(*index).ok_or_else(|| missing_group(scope))?;
        }
        Ok(group)
    }

    pub fn get_nested_group_mut(&mut self, scope: &Scope) -> Result<&mut MarkSpec> {
        let (first, rest) = scope
            .as_slice()
            .split_first()
            .ok_or_else(|| ChartError::internal("the root scope is not a group"))?;
        let mut group = self
            .marks
            .iter_mut()
            .filter(|m| m.is_group())
            .nth(*first as usize)
            .ok_or_else(|| missing_group(scope))?;
        for index in rest {
            group = group
                .get_group_mut(*index)
                .ok_or_else(|| missing_group(scope))?;
        }
        Ok(group)
    }

    pub(crate) fn lists(&self, scope: &Scope) -> Result<(&Vec<SignalSpec>, &Vec<DataSpec>)> {
        if scope.is_root() {
            Ok((&self.signals, &self.data))
        } else {
            let group = self.get_nested_group(scope)?;
            Ok((&group.signals, &group.data))
        }
    }

    pub(crate) fn lists_mut(&mut self, scope: &Scope) -> Result<(&mut Vec<SignalSpec>, &mut Vec<DataSpec>)> {
        if scope.is_root() {
            Ok((&mut self.signals, &mut self.data))
        } else {
            let group = self.get_nested_group_mut(scope)?;
            Ok((&mut group.signals, &mut group.data))
        }
    }

    pub fn get_nested_signal(&self, scope: &Scope, name: &str) -> Result<&SignalSpec> {
        self.lists(scope)?
            .0
            .iter()
            .find(|s| s.name == name && s.is_definition())
            .ok_or_else(|| not_found("signal", name, scope))
    }

    pub fn get_nested_signal_mut(&mut self, scope: &Scope, name: &str) -> Result<&mut SignalSpec> {
        self.lists_mut(scope)?
            .0
            .iter_mut()
            .find(|s| s.name == name && s.is_definition())
            .ok_or_else(|| not_found("signal", name, scope))
    }

    pub fn get_nested_data(&self, scope: &Scope, name: &str) -> Result<&DataSpec> {
        self.lists(scope)?
            .1
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| not_found("dataset", name, scope))
    }

    pub fn get_nested_data_mut(&mut self, scope: &Scope, name: &str) -> Result<&mut DataSpec> {
        self.lists_mut(scope)?
            .1
            .iter_mut()
            .find(|d| d.name == name)
            .ok_or_else(|| not_found("dataset", name, scope))
    }

    /// Insert a signal definition at `index` (or append).
    pub fn add_nested_signal(
        &mut self,
        scope: &Scope,
        signal: SignalSpec,
        index: Option<usize>,
    ) -> Result<()> {
        let signals = self.lists_mut(scope)?.0;
        let at = index.unwrap_or(signals.len()).min(signals.len());
        signals.insert(at, signal);
        Ok(())
    }

    /// Insert a dataset definition at `index` (or append).
    pub fn add_nested_data(&mut self, scope: &Scope, data: DataSpec, index: Option<usize>) -> Result<()> {
        let datasets = self.lists_mut(scope)?.1;
        let at = index.unwrap_or(datasets.len()).min(datasets.len());
        datasets.insert(at, data);
        Ok(())
    }
}

fn not_found(kind: &str, name: &str, scope: &Scope) -> ChartError {
    ChartError::invalid_spec(format!("no {kind} named '{name}' at scope {scope}"))
}
