//! Build a [`TaskGraph`] from a [`ChartSpec`].
//!
//! Every definition is declared first so references may point forward or
//! into enclosing scopes; edges are wired in a second pass. References made
//! by server-evaluable definitions must resolve. References scanned out of
//! client-only material (unsupported transforms, marks, facets) are wired
//! when they resolve and skipped otherwise.

use serde_json::Value;
use tracing::debug;

use super::{DataSource, DatasetTask, NodeIndex, NodeKind, Scope, Task, TaskGraph, Variable};
use crate::error::{ChartError, Result};
use crate::expr::Expression;
use crate::inline::inline_dataset_name;
use crate::spec::{
    mark_inputs, ChartSpec, ChartVisitor, DataSpec, MarkSpec, SignalSpec, StringOrSignal,
    TransformSpec,
};

/// Signals the client runtime defines at the top level.
pub const BUILTIN_SIGNALS: &[&str] = &["width", "height", "padding", "autosize", "background"];

pub fn build_graph(spec: &ChartSpec) -> Result<TaskGraph> {
    let mut declare = Declare::default();
    for name in BUILTIN_SIGNALS {
        let user_defined = spec
            .signals
            .iter()
            .any(|s| s.name == *name && s.is_definition());
        if !user_defined {
            declare.graph.add_node(
                Variable::signal(*name).scoped(Scope::root()),
                NodeKind::Signal,
                Task::Client,
            )?;
        }
    }
    spec.walk(&mut declare)?;

    let Declare { mut graph, wiring } = declare;
    for w in wiring {
        let inputs = w.resolve(&graph)?;
        graph.node_mut(w.node).inputs = inputs;
    }
    graph.toposort()?;
    Ok(graph)
}

/// Edges still to be resolved for one node.
struct Wiring {
    node: NodeIndex,
    /// Scope references are resolved from.
    scope: Scope,
    fixed: Vec<NodeIndex>,
    strict: Vec<Variable>,
    lenient: Vec<Variable>,
}

impl Wiring {
    fn new(node: NodeIndex, scope: &Scope) -> Self {
        Self {
            node,
            scope: scope.clone(),
            fixed: Vec::new(),
            strict: Vec::new(),
            lenient: Vec::new(),
        }
    }

    fn resolve(&self, graph: &TaskGraph) -> Result<Vec<NodeIndex>> {
        let mut inputs = self.fixed.clone();
        let mut push = |idx: NodeIndex| {
            if !inputs.contains(&idx) {
                inputs.push(idx);
            }
        };
        for var in &self.strict {
            let idx = graph.resolve(var, &self.scope).ok_or_else(|| {
                ChartError::invalid_spec(format!(
                    "{} references undefined {var} from scope {}",
                    graph.node(self.node).variable,
                    self.scope
                ))
            })?;
            push(idx);
        }
        for var in &self.lenient {
            match graph.resolve(var, &self.scope) {
                Some(idx) => push(idx),
                None => debug!(
                    node = %graph.node(self.node).variable,
                    reference = %var,
                    "skipping unresolved client-side reference"
                ),
            }
        }
        Ok(inputs)
    }
}

#[derive(Default)]
struct Declare {
    graph: TaskGraph,
    wiring: Vec<Wiring>,
}

impl Declare {
    /// A dataset that only the client can produce (facets, named marks).
    fn client_dataset(&mut self, name: &str, scope: &Scope, lenient: Vec<Variable>) -> Result<()> {
        let node = self.graph.add_node(
            Variable::data(name).scoped(scope.clone()),
            NodeKind::Dataset,
            Task::Client,
        )?;
        let mut wiring = Wiring::new(node, scope);
        wiring.lenient = lenient;
        self.wiring.push(wiring);
        Ok(())
    }
}

fn dataset_task(data: &DataSpec) -> Task {
    let sources = data.sources();
    let source = if sources.len() > 1 {
        // unions of several parents stay on the client
        return Task::Client;
    } else if !sources.is_empty() {
        DataSource::Parent
    } else {
        match &data.url {
            Some(StringOrSignal::String(url)) => match inline_dataset_name(url) {
                Some(name) => DataSource::Inline(name.to_string()),
                None => DataSource::Url(url.clone()),
            },
            Some(StringOrSignal::Signal(_)) => return Task::Client,
            None => match &data.values {
                Some(values) => DataSource::Values {
                    values: values.clone(),
                    format: data.format.clone(),
                },
                None => DataSource::Empty,
            },
        }
    };
    Task::Dataset(DatasetTask {
        source,
        transforms: data.transform.clone(),
    })
}

impl ChartVisitor for Declare {
    fn visit_data(&mut self, data: &DataSpec, scope: &Scope) -> Result<()> {
        let node = self.graph.add_node(
            Variable::data(data.name.clone()).scoped(scope.clone()),
            NodeKind::Dataset,
            dataset_task(data),
        )?;
        let mut wiring = Wiring::new(node, scope);
        wiring.strict.extend(data.sources().into_iter().map(Variable::data));
        if let Some(StringOrSignal::Signal(r)) = &data.url {
            if let Ok(expr) = Expression::parse(&r.signal) {
                wiring.lenient.extend(expr.input_vars());
            }
        }

        let mut published: Vec<Variable> = Vec::new();
        let mut output_index = 0;
        for tx in &data.transform {
            let reads = tx
                .input_vars()
                .into_iter()
                .filter(|v| !published.contains(v));
            match tx {
                TransformSpec::Supported(_) => wiring.strict.extend(reads),
                TransformSpec::Unsupported(_) => wiring.lenient.extend(reads),
            }
            for name in tx.output_signals() {
                let task = if tx.is_supported() {
                    Task::TransformOutput {
                        index: output_index,
                    }
                } else {
                    Task::Client
                };
                let output = self.graph.add_node(
                    Variable::signal(name.clone()).scoped(scope.clone()),
                    NodeKind::Transform,
                    task,
                )?;
                let mut out_wiring = Wiring::new(output, scope);
                out_wiring.fixed.push(node);
                self.wiring.push(out_wiring);
                published.push(Variable::signal(name));
                output_index += 1;
            }
        }
        self.wiring.push(wiring);
        Ok(())
    }

    fn visit_signal(&mut self, signal: &SignalSpec, scope: &Scope) -> Result<()> {
        if !signal.is_definition() {
            return Ok(());
        }
        let (task, reads) = match signal.expression() {
            Some(src) => match Expression::parse(src) {
                Ok(expr) => {
                    let reads = expr.input_vars();
                    (Task::Signal(expr), reads)
                }
                Err(err) => {
                    debug!(signal = %signal.name, error = %err, "signal expression left to the client");
                    (Task::Client, Vec::new())
                }
            },
            None => (
                Task::Value(signal.value.clone().unwrap_or(Value::Null)),
                Vec::new(),
            ),
        };
        let node = self.graph.add_node(
            Variable::signal(signal.name.clone()).scoped(scope.clone()),
            NodeKind::Signal,
            task,
        )?;
        let mut wiring = Wiring::new(node, scope);
        wiring.strict = reads;
        self.wiring.push(wiring);
        Ok(())
    }

    fn visit_group_mark(&mut self, mark: &MarkSpec, scope: &Scope) -> Result<()> {
        let parent = scope.parent().unwrap_or_default();
        if let Some(facet) = mark.from.as_ref().and_then(|f| f.facet.as_ref()) {
            self.client_dataset(&facet.name, scope, vec![Variable::data(facet.data.clone())])?;
        }
        if let Some(name) = &mark.name {
            self.client_dataset(name, &parent, mark_inputs(mark))?;
        }
        Ok(())
    }

    fn visit_non_group_mark(&mut self, mark: &MarkSpec, scope: &Scope) -> Result<()> {
        if let Some(name) = &mark.name {
            self.client_dataset(name, scope, mark_inputs(mark))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn build(value: Value) -> Result<TaskGraph> {
        build_graph(&ChartSpec::from_value(value)?)
    }

    fn index(graph: &TaskGraph, var: Variable, scope: Vec<u32>) -> NodeIndex {
        graph.get(&var.scoped(Scope::new(scope))).unwrap()
    }

    #[test]
    fn wires_sources_signals_and_transform_outputs() {
        let graph = build(json!({
            "signals": [{"name": "threshold", "value": 3}],
            "data": [
                {"name": "source", "values": [{"x": 1}, {"x": 5}]},
                {"name": "filtered", "source": "source", "transform": [
                    {"type": "filter", "expr": "datum.x > threshold"},
                    {"type": "extent", "field": "x", "signal": "x_extent"},
                    {"type": "bin", "field": "x", "extent": {"signal": "x_extent"}, "signal": "x_bins"}
                ]}
            ]
        }))
        .unwrap();

        let source = index(&graph, Variable::data("source"), vec![]);
        let threshold = index(&graph, Variable::signal("threshold"), vec![]);
        let filtered = index(&graph, Variable::data("filtered"), vec![]);
        assert_eq!(graph.node(filtered).inputs, vec![source, threshold]);

        let bins = index(&graph, Variable::signal("x_bins"), vec![]);
        assert_eq!(graph.node(bins).kind, NodeKind::Transform);
        assert_eq!(graph.node(bins).task, Task::TransformOutput { index: 1 });
        assert_eq!(graph.node(bins).inputs, vec![filtered]);
        assert!(graph.get(&Variable::signal("width").scoped(Scope::root())).is_some());
    }

    #[test]
    fn nested_scopes_resolve_outward() {
        let graph = build(json!({
            "signals": [{"name": "k", "value": 2}],
            "marks": [{"type": "group",
                "data": [{"name": "inner", "values": [], "transform": [
                    {"type": "formula", "expr": "datum.a * k", "as": "b"}
                ]}],
                "marks": [{"type": "rect", "name": "bars", "from": {"data": "inner"}}]
            }]
        }))
        .unwrap();
        let inner = index(&graph, Variable::data("inner"), vec![0]);
        let k = index(&graph, Variable::signal("k"), vec![]);
        assert_eq!(graph.node(inner).inputs, vec![k]);
        let bars = index(&graph, Variable::data("bars"), vec![0]);
        assert_eq!(graph.node(bars).task, Task::Client);
        assert_eq!(graph.node(bars).inputs, vec![inner]);
    }

    #[test]
    fn user_definition_replaces_builtin() {
        let graph = build(json!({"signals": [{"name": "width", "value": 400}]})).unwrap();
        let width = index(&graph, Variable::signal("width"), vec![]);
        assert_eq!(graph.node(width).task, Task::Value(json!(400)));
    }

    #[test]
    fn unresolved_and_cyclic_references_are_invalid() {
        let err = build(json!({"signals": [{"name": "a", "update": "missing + 1"}]})).unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)), "{err}");

        let err = build(json!({"signals": [
            {"name": "a", "update": "b + 1"},
            {"name": "b", "update": "a + 1"}
        ]}))
        .unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");

        let err = build(json!({"data": [{"name": "d"}, {"name": "d"}]})).unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)));
    }

    #[test]
    fn client_material_is_lenient() {
        let graph = build(json!({
            "data": [{"name": "d", "values": [], "transform": [
                {"type": "lookup", "from": "nowhere", "key": "id", "fields": ["id"]}
            ]}],
            "marks": [{"type": "symbol", "name": "points",
                       "encode": {"update": {"x": {"signal": "unknown_signal"}}}}]
        }))
        .unwrap();
        let d = index(&graph, Variable::data("d"), vec![]);
        assert!(graph.node(d).inputs.is_empty());
    }

    #[test]
    fn inline_urls_become_inline_sources() {
        let graph = build(json!({"data": [
            {"name": "orders", "url": "table://order_items"},
            {"name": "remote", "url": "order_items"}
        ]}))
        .unwrap();
        let orders = index(&graph, Variable::data("orders"), vec![]);
        let Task::Dataset(task) = &graph.node(orders).task else {
            panic!("expected a dataset task");
        };
        assert_eq!(task.source, DataSource::Inline("order_items".into()));
        let remote = index(&graph, Variable::data("remote"), vec![]);
        let Task::Dataset(task) = &graph.node(remote).task else {
            panic!("expected a dataset task");
        };
        assert_eq!(task.source, DataSource::Url("order_items".into()));
    }
}
