//! Scope-aware traversal of a chart spec.

use serde_json::{Map, Value};
use tracing::debug;

use super::data::DataSpec;
use super::mark::MarkSpec;
use super::signal::SignalSpec;
use crate::error::Result;
use crate::expr::Expression;
use crate::graph::{Scope, Variable};

/// Read-only traversal. Group marks are visited with the scope they
/// introduce; every other item with the scope it is defined in.
pub trait ChartVisitor {
    fn visit_data(&mut self, _data: &DataSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }

    fn visit_signal(&mut self, _signal: &SignalSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }

    fn visit_group_mark(&mut self, _mark: &MarkSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }

    fn visit_non_group_mark(&mut self, _mark: &MarkSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }
}

pub trait MutChartVisitor {
    fn visit_data(&mut self, _data: &mut DataSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }

    fn visit_signal(&mut self, _signal: &mut SignalSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }

    fn visit_group_mark(&mut self, _mark: &mut MarkSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }

    fn visit_non_group_mark(&mut self, _mark: &mut MarkSpec, _scope: &Scope) -> Result<()> {
        Ok(())
    }
}

/// Collect the variables referenced by a rendering-side JSON fragment:
/// `{"signal": expr}`, `{"test": expr}` and `{"data": name}` at any depth.
///
/// Expressions that fail to parse are skipped; they only ever run on the
/// client.
pub fn scan_json_inputs(value: &Value, out: &mut Vec<Variable>) {
    match value {
        Value::Object(map) => scan_object_inputs(map, out),
        Value::Array(items) => items.iter().for_each(|v| scan_json_inputs(v, out)),
        _ => {}
    }
}

pub fn scan_object_inputs(map: &Map<String, Value>, out: &mut Vec<Variable>) {
    for (key, v) in map {
        match (key.as_str(), v) {
            ("signal" | "test", Value::String(src)) => scan_expression(src, out),
            ("data", Value::String(name)) => out.push(Variable::data(name.clone())),
            _ => scan_json_inputs(v, out),
        }
    }
}

/// Variables read by a signal's event handlers.
pub fn scan_handler_inputs(handlers: &[Value], out: &mut Vec<Variable>) {
    for handler in handlers {
        if let Some(update) = handler.get("update").and_then(Value::as_str) {
            scan_expression(update, out);
        }
        if let Some(events) = handler.get("events") {
            scan_json_inputs(events, out);
        }
    }
}

fn scan_expression(src: &str, out: &mut Vec<Variable>) {
    match Expression::parse(src) {
        Ok(expr) => out.extend(expr.input_vars()),
        Err(err) => debug!(expression = src, error = %err, "skipping unparsable client expression"),
    }
}

/// Inputs of a mark itself, not counting nested definitions.
pub fn mark_inputs(mark: &MarkSpec) -> Vec<Variable> {
    let mut out = Vec::new();
    if let Some(from) = &mark.from {
        if let Some(data) = &from.data {
            out.push(Variable::data(data.clone()));
        }
        if let Some(facet) = &from.facet {
            out.push(Variable::data(facet.data.clone()));
            scan_object_inputs(&facet.extra, &mut out);
        }
        scan_object_inputs(&from.extra, &mut out);
    }
    scan_object_inputs(&mark.extra, &mut out);
    out
}
