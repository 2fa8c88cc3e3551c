//! Which side of the split each node of the full graph belongs to.

use serde::Serialize;

use super::PlannerConfig;
use crate::error::Result;
use crate::graph::{DataSource, Node, NodeIndex, NodeKind, Task, TaskGraph, Variable};
use crate::spec::{ChartSpec, TransformSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Support {
    /// The server can compute the whole node.
    Full,
    /// The server can compute the source and the first `k` transforms.
    Partial(usize),
    /// Changed by user interaction on the client.
    ClientDriven,
    /// A literal both sides can hold a copy of.
    Mirrored,
    Unsupported,
}

/// Classify every node, inputs before dependents.
pub fn classify(spec: &ChartSpec, graph: &TaskGraph, config: &PlannerConfig) -> Result<Vec<Support>> {
    let mut support = vec![Support::Unsupported; graph.len()];
    for idx in graph.toposort()? {
        let node = graph.node(idx);
        support[idx.0] = match node.kind {
            NodeKind::Signal => signal_support(spec, node, &support, config),
            NodeKind::Dataset => dataset_support(spec, graph, node, &support, config),
            NodeKind::Transform => transform_output_support(spec, graph, node, &support),
        };
    }
    Ok(support)
}

/// Whether the server may read the node's value.
pub(super) fn server_readable(support: Support, config: &PlannerConfig) -> bool {
    match support {
        Support::Full | Support::Mirrored => true,
        Support::ClientDriven => config.allow_client_to_server_comms,
        Support::Partial(_) | Support::Unsupported => false,
    }
}

fn signal_support(
    spec: &ChartSpec,
    node: &Node,
    support: &[Support],
    config: &PlannerConfig,
) -> Support {
    // builtins have no definition in the spec
    let Ok(signal) = spec.get_nested_signal(node.scope(), node.name()) else {
        return Support::Unsupported;
    };
    if signal.is_interactive() {
        return Support::ClientDriven;
    }
    match &node.task {
        Task::Value(_) => Support::Mirrored,
        Task::Signal(expr)
            if expr.is_supported()
                && node
                    .inputs
                    .iter()
                    .all(|i| server_readable(support[i.0], config)) =>
        {
            Support::Full
        }
        _ => Support::Unsupported,
    }
}

fn dataset_support(
    spec: &ChartSpec,
    graph: &TaskGraph,
    node: &Node,
    support: &[Support],
    config: &PlannerConfig,
) -> Support {
    let Ok(data) = spec.get_nested_data(node.scope(), node.name()) else {
        return Support::Unsupported;
    };
    if data.on.is_some() {
        return Support::ClientDriven;
    }
    let Task::Dataset(task) = &node.task else {
        return Support::Unsupported;
    };
    if data.is_values_only() {
        return Support::Mirrored;
    }

    let source_readable = match &task.source {
        DataSource::Url(table) => config.server_tables.contains(table),
        DataSource::Parent => node
            .inputs
            .first()
            .is_some_and(|p| server_readable(support[p.0], config)),
        DataSource::Inline(_) | DataSource::Values { .. } | DataSource::Empty => true,
    };
    if !source_readable {
        return Support::Unsupported;
    }

    let k = supported_prefix(graph, node, &task.transforms, support, config);
    if k == task.transforms.len() {
        Support::Full
    } else if k > 0 || matches!(task.source, DataSource::Url(_) | DataSource::Inline(_)) {
        Support::Partial(k)
    } else {
        Support::Unsupported
    }
}

/// Leading transforms that are supported and read only server-readable
/// variables.
fn supported_prefix(
    graph: &TaskGraph,
    node: &Node,
    transforms: &[TransformSpec],
    support: &[Support],
    config: &PlannerConfig,
) -> usize {
    let mut published: Vec<Variable> = Vec::new();
    for (k, tx) in transforms.iter().enumerate() {
        let readable = tx.is_supported()
            && tx
                .input_vars()
                .iter()
                .filter(|v| !published.contains(v))
                .all(|v| {
                    graph
                        .resolve(v, node.scope())
                        .is_some_and(|i| server_readable(support[i.0], config))
                });
        if !readable {
            return k;
        }
        published.extend(tx.output_signals().into_iter().map(Variable::signal));
    }
    transforms.len()
}

fn transform_output_support(
    spec: &ChartSpec,
    graph: &TaskGraph,
    node: &Node,
    support: &[Support],
) -> Support {
    if !matches!(node.task, Task::TransformOutput { .. }) {
        return Support::Unsupported;
    }
    let Some(parent) = node.inputs.first().copied() else {
        return Support::Unsupported;
    };
    match support[parent.0] {
        Support::Full => Support::Full,
        Support::Partial(k) => {
            let parent = graph.node(parent);
            let position = spec
                .get_nested_data(parent.scope(), parent.name())
                .ok()
                .and_then(|d| {
                    d.transform
                        .iter()
                        .position(|tx| tx.output_signals().iter().any(|s| s == node.name()))
                });
            match position {
                Some(p) if p < k => Support::Full,
                _ => Support::Unsupported,
            }
        }
        _ => Support::Unsupported,
    }
}

/// Nodes read by the server-side part of `idx`: everything for a fully
/// supported node, the source and prefix reads for a partial dataset.
pub(super) fn server_reads(
    spec: &ChartSpec,
    graph: &TaskGraph,
    idx: NodeIndex,
    support: Support,
) -> Vec<NodeIndex> {
    let node = graph.node(idx);
    let Support::Partial(k) = support else {
        return node.inputs.clone();
    };
    let Ok(data) = spec.get_nested_data(node.scope(), node.name()) else {
        return Vec::new();
    };
    let mut vars: Vec<Variable> = data.sources().into_iter().map(Variable::data).collect();
    let mut published: Vec<Variable> = Vec::new();
    for tx in data.transform.iter().take(k) {
        vars.extend(tx.input_vars().into_iter().filter(|v| !published.contains(v)));
        published.extend(tx.output_signals().into_iter().map(Variable::signal));
    }
    vars.iter()
        .filter_map(|v| graph.resolve(v, node.scope()))
        .collect()
}
