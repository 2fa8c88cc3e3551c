//! The dependency graph of a chart spec.
//!
//! Nodes live in an arena addressed by [`NodeIndex`]; a `ScopedVariable`
//! index maps each definition to its node. Edges point from a node to the
//! nodes it reads. Identity is `(name, namespace, scope)`; the fingerprint
//! is content-derived and ignores names and positions.

mod builder;
mod variable;

pub use builder::{build_graph, BUILTIN_SIGNALS};
pub use variable::{Namespace, Scope, ScopedVariable, Variable};

use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{ChartError, Result};
use crate::expr::Expression;
use crate::spec::TransformSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIndex(pub usize);

impl fmt::Display for NodeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeKind {
    Signal,
    Dataset,
    /// A signal published by a dataset's transform pipeline.
    Transform,
}

/// Where a dataset's rows come from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DataSource {
    /// Literal `values`, with the spec's `format` if any.
    Values { values: Value, format: Option<Value> },
    /// A caller-supplied table named by an inline URL.
    Inline(String),
    /// A table exposed by the connection.
    Url(String),
    /// The parent dataset, which is always `inputs[0]`.
    Parent,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetTask {
    pub source: DataSource,
    pub transforms: Vec<TransformSpec>,
}

/// What a node computes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Task {
    Value(Value),
    Signal(Expression),
    Dataset(DatasetTask),
    /// The `index`-th signal published by the dataset in `inputs[0]`.
    TransformOutput { index: usize },
    /// Only the client runtime can compute this node.
    Client,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub variable: ScopedVariable,
    pub kind: NodeKind,
    pub task: Task,
    pub inputs: Vec<NodeIndex>,
}

impl Node {
    pub fn name(&self) -> &str {
        self.variable.name()
    }

    pub fn scope(&self) -> &Scope {
        &self.variable.scope
    }
}

/// Values outside the graph that a node's result depends on.
#[derive(Debug, Clone, Default)]
pub struct FingerprintContext {
    /// Inline dataset name to content fingerprint.
    pub inline: HashMap<String, String>,
    pub connection_id: String,
    pub local_tz: String,
    pub default_input_tz: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskGraph {
    nodes: Vec<Node>,
    index: HashMap<ScopedVariable, NodeIndex>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx.0]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx.0]
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> {
        (0..self.nodes.len()).map(NodeIndex)
    }

    /// The node defining exactly `var`.
    pub fn get(&self, var: &ScopedVariable) -> Option<NodeIndex> {
        self.index.get(var).copied()
    }

    /// Resolve a reference made from `scope`: the scope itself first, then
    /// each enclosing scope.
    pub fn resolve(&self, var: &Variable, scope: &Scope) -> Option<NodeIndex> {
        scope
            .ancestors()
            .find_map(|s| self.get(&var.clone().scoped(s)))
    }

    pub(crate) fn add_node(
        &mut self,
        variable: ScopedVariable,
        kind: NodeKind,
        task: Task,
    ) -> Result<NodeIndex> {
        if self.index.contains_key(&variable) {
            return Err(ChartError::invalid_spec(format!(
                "{variable} is defined more than once"
            )));
        }
        let idx = NodeIndex(self.nodes.len());
        self.index.insert(variable.clone(), idx);
        self.nodes.push(Node {
            variable,
            kind,
            task,
            inputs: Vec::new(),
        });
        Ok(idx)
    }

    /// Nodes that read each node.
    pub fn dependents(&self) -> Vec<Vec<NodeIndex>> {
        let mut out = vec![Vec::new(); self.nodes.len()];
        for (i, node) in self.nodes.iter().enumerate() {
            for input in &node.inputs {
                out[input.0].push(NodeIndex(i));
            }
        }
        out
    }

    /// `targets` and everything they transitively read.
    pub fn ancestors(&self, targets: impl IntoIterator<Item = NodeIndex>) -> BTreeSet<NodeIndex> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<NodeIndex> = targets.into_iter().collect();
        while let Some(idx) = stack.pop() {
            if seen.insert(idx) {
                stack.extend(self.node(idx).inputs.iter().copied());
            }
        }
        seen
    }

    /// Kahn's algorithm, always taking the lowest ready index so the order
    /// is deterministic. A cycle is an `InvalidSpec` naming its members.
    pub fn toposort(&self) -> Result<Vec<NodeIndex>> {
        let dependents = self.dependents();
        let mut pending: Vec<usize> = self.nodes.iter().map(|n| n.inputs.len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(NodeIndex(i));
            for dep in &dependents[i] {
                pending[dep.0] -= 1;
                if pending[dep.0] == 0 {
                    ready.push(Reverse(dep.0));
                }
            }
        }

        if order.len() < self.nodes.len() {
            let cycle: Vec<String> = pending
                .iter()
                .enumerate()
                .filter(|(_, n)| **n > 0)
                .map(|(i, _)| self.nodes[i].variable.to_string())
                .collect();
            return Err(ChartError::invalid_spec(format!(
                "dependency cycle among {}",
                cycle.join(", ")
            )));
        }
        Ok(order)
    }

    /// SHA-256 fingerprint of every node, indexed like the arena.
    ///
    /// Covers the node kind, its task, its inputs' fingerprints, and the
    /// external values it reads. Names are not included, so equal
    /// definitions over equal inputs share a fingerprint wherever they sit.
    pub fn compute_fingerprints(&self, ctx: &FingerprintContext) -> Result<Vec<String>> {
        let mut fingerprints = vec![String::new(); self.nodes.len()];
        for idx in self.toposort()? {
            let node = self.node(idx);
            let mut hasher = Sha256::new();
            hasher.update(serde_json::to_vec(&node.kind)?);
            hasher.update(serde_json::to_vec(&node.task)?);
            for input in &node.inputs {
                hasher.update(fingerprints[input.0].as_bytes());
            }
            if let Task::Dataset(task) = &node.task {
                match &task.source {
                    DataSource::Inline(name) => {
                        let fp = ctx.inline.get(name).ok_or_else(|| {
                            ChartError::invalid_spec(format!(
                                "inline dataset '{name}' referenced by {} was not provided",
                                node.variable
                            ))
                        })?;
                        hasher.update(fp.as_bytes());
                    }
                    DataSource::Url(table) => {
                        hasher.update(ctx.connection_id.as_bytes());
                        hasher.update(table.as_bytes());
                    }
                    DataSource::Values { .. } | DataSource::Parent | DataSource::Empty => {}
                }
            }
            hasher.update(ctx.local_tz.as_bytes());
            hasher.update(ctx.default_input_tz.as_bytes());
            fingerprints[idx.0] = hex::encode(hasher.finalize());
        }
        Ok(fingerprints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn signal(graph: &mut TaskGraph, name: &str, scope: Scope, task: Task) -> NodeIndex {
        graph
            .add_node(Variable::signal(name).scoped(scope), NodeKind::Signal, task)
            .unwrap()
    }

    #[test]
    fn resolve_walks_enclosing_scopes() {
        let mut graph = TaskGraph::new();
        let root = signal(&mut graph, "a", Scope::root(), Task::Value(json!(1)));
        let inner = signal(&mut graph, "a", Scope::new(vec![0]), Task::Value(json!(2)));
        let var = Variable::signal("a");
        assert_eq!(graph.resolve(&var, &Scope::new(vec![0, 3])), Some(inner));
        assert_eq!(graph.resolve(&var, &Scope::new(vec![1])), Some(root));
        assert_eq!(graph.resolve(&Variable::data("a"), &Scope::root()), None);
    }

    #[test]
    fn duplicate_definition_is_rejected() {
        let mut graph = TaskGraph::new();
        signal(&mut graph, "a", Scope::root(), Task::Value(json!(1)));
        let err = graph
            .add_node(
                Variable::signal("a").scoped(Scope::root()),
                NodeKind::Signal,
                Task::Value(json!(2)),
            )
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)));
    }

    #[test]
    fn toposort_is_deterministic_and_detects_cycles() {
        let mut graph = TaskGraph::new();
        let a = signal(&mut graph, "a", Scope::root(), Task::Client);
        let b = signal(&mut graph, "b", Scope::root(), Task::Client);
        let c = signal(&mut graph, "c", Scope::root(), Task::Client);
        graph.node_mut(a).inputs = vec![c];
        graph.node_mut(b).inputs = vec![a];
        assert_eq!(graph.toposort().unwrap(), vec![c, a, b]);

        graph.node_mut(c).inputs = vec![b];
        let err = graph.toposort().unwrap_err().to_string();
        assert!(err.contains("signal:a@[]") && err.contains("signal:c@[]"), "{err}");
    }

    #[test]
    fn fingerprints_ignore_names_but_not_inputs() {
        let mut graph = TaskGraph::new();
        let x = signal(&mut graph, "x", Scope::root(), Task::Value(json!(5)));
        let y = signal(&mut graph, "y", Scope::new(vec![2]), Task::Value(json!(5)));
        let z = signal(&mut graph, "z", Scope::root(), Task::Value(json!(6)));
        let expr = || Task::Signal(Expression::parse("v * 2").unwrap());
        let fx = signal(&mut graph, "fx", Scope::root(), expr());
        let fy = signal(&mut graph, "fy", Scope::root(), expr());
        let fz = signal(&mut graph, "fz", Scope::root(), expr());
        graph.node_mut(fx).inputs = vec![x];
        graph.node_mut(fy).inputs = vec![y];
        graph.node_mut(fz).inputs = vec![z];

        let fps = graph.compute_fingerprints(&FingerprintContext::default()).unwrap();
        assert_eq!(fps[x.0], fps[y.0]);
        assert_eq!(fps[fx.0], fps[fy.0]);
        assert_ne!(fps[fx.0], fps[fz.0]);
        assert_eq!(fps[fx.0].len(), 64);
    }

    #[test]
    fn missing_inline_dataset_is_invalid() {
        let mut graph = TaskGraph::new();
        graph
            .add_node(
                Variable::data("orders").scoped(Scope::root()),
                NodeKind::Dataset,
                Task::Dataset(DatasetTask {
                    source: DataSource::Inline("orders".into()),
                    transforms: Vec::new(),
                }),
            )
            .unwrap();
        let err = graph
            .compute_fingerprints(&FingerprintContext::default())
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)));
    }
}
