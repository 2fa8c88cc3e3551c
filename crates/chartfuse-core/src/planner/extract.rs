//! Move server-evaluable definitions out of the client spec.

use std::collections::BTreeSet;

use super::support::{server_reads, Support};
use super::PlannerConfig;
use crate::error::Result;
use crate::graph::{NodeIndex, NodeKind, Scope, ScopedVariable, TaskGraph, Variable};
use crate::spec::{
    ChartSpec, ChartVisitor, DataSpec, MarkSpec, MutChartVisitor, OneOrMany, SignalSpec,
};

/// Prefix of the server dataset feeding a partially supported one.
pub const SERVER_DATASET_PREFIX: &str = "_server_";

pub(super) struct Extraction {
    pub server_spec: ChartSpec,
    pub client_spec: ChartSpec,
    /// Client definitions whose values now come from the server.
    pub moved: BTreeSet<ScopedVariable>,
    /// Datasets split between the two sides.
    pub partial: Vec<ScopedVariable>,
}

pub(super) fn extract(
    spec: &ChartSpec,
    graph: &TaskGraph,
    support: &[Support],
    config: &PlannerConfig,
) -> Result<Extraction> {
    let server = server_nodes(spec, graph, support, config);

    let mut defs = CollectDefinitions::default();
    spec.walk(&mut defs)?;

    let mut server_spec = ChartSpec {
        schema: spec.schema.clone(),
        marks: skeleton(&spec.marks),
        ..ChartSpec::default()
    };
    for (scope, def) in defs.0 {
        match def {
            Definition::Data(data) => {
                let var = Variable::data(data.name.clone()).scoped(scope.clone());
                let Some(idx) = graph.get(&var).filter(|i| server.contains(i)) else {
                    continue;
                };
                let data = match support[idx.0] {
                    Support::Partial(k) => server_half(&data, k),
                    _ => data,
                };
                server_spec.add_nested_data(&scope, data, None)?;
            }
            Definition::Signal(signal) => {
                let var = Variable::signal(signal.name.clone()).scoped(scope.clone());
                if graph.get(&var).is_some_and(|i| server.contains(&i)) {
                    server_spec.add_nested_signal(&scope, signal, None)?;
                }
            }
        }
    }

    let mut client_spec = spec.clone();
    let mut rewrite = ClientRewrite {
        graph,
        support,
        server: &server,
        moved: BTreeSet::new(),
        partial: Vec::new(),
    };
    client_spec.walk_mut(&mut rewrite)?;

    Ok(Extraction {
        server_spec,
        client_spec,
        moved: rewrite.moved,
        partial: rewrite.partial,
    })
}

/// Fully and partially supported datasets, kept signals, and every fully
/// supported or mirrored node they read.
fn server_nodes(
    spec: &ChartSpec,
    graph: &TaskGraph,
    support: &[Support],
    config: &PlannerConfig,
) -> BTreeSet<NodeIndex> {
    let mut stack: Vec<NodeIndex> = graph
        .indices()
        .filter(|i| {
            graph.node(*i).kind == NodeKind::Dataset
                && matches!(support[i.0], Support::Full | Support::Partial(_))
        })
        .collect();
    stack.extend(
        config
            .keep_signals
            .iter()
            .filter_map(|v| graph.get(v))
            .filter(|i| support[i.0] == Support::Full),
    );

    let mut server = BTreeSet::new();
    while let Some(idx) = stack.pop() {
        if !server.insert(idx) {
            continue;
        }
        for input in server_reads(spec, graph, idx, support[idx.0]) {
            // transform outputs come with their dataset
            if graph.node(input).kind == NodeKind::Transform {
                continue;
            }
            if matches!(support[input.0], Support::Full | Support::Mirrored) {
                stack.push(input);
            }
        }
    }
    server
}

/// The group marks of `marks`, recursively, with nothing else, so group
/// indexes stay valid on the server.
fn skeleton(marks: &[MarkSpec]) -> Vec<MarkSpec> {
    marks
        .iter()
        .filter(|m| m.is_group())
        .map(|m| MarkSpec {
            marks: skeleton(&m.marks),
            ..MarkSpec::group()
        })
        .collect()
}

/// The source and supported prefix of a partially supported dataset.
fn server_half(data: &DataSpec, k: usize) -> DataSpec {
    DataSpec {
        name: format!("{SERVER_DATASET_PREFIX}{}", data.name),
        source: data.source.clone(),
        url: data.url.clone(),
        format: data.format.clone(),
        values: data.values.clone(),
        transform: data.transform[..k].to_vec(),
        ..DataSpec::default()
    }
}

enum Definition {
    Data(DataSpec),
    Signal(SignalSpec),
}

#[derive(Default)]
struct CollectDefinitions(Vec<(Scope, Definition)>);

impl ChartVisitor for CollectDefinitions {
    fn visit_data(&mut self, data: &DataSpec, scope: &Scope) -> Result<()> {
        self.0.push((scope.clone(), Definition::Data(data.clone())));
        Ok(())
    }

    fn visit_signal(&mut self, signal: &SignalSpec, scope: &Scope) -> Result<()> {
        if signal.is_definition() {
            self.0.push((scope.clone(), Definition::Signal(signal.clone())));
        }
        Ok(())
    }
}

struct ClientRewrite<'a> {
    graph: &'a TaskGraph,
    support: &'a [Support],
    server: &'a BTreeSet<NodeIndex>,
    moved: BTreeSet<ScopedVariable>,
    partial: Vec<ScopedVariable>,
}

impl MutChartVisitor for ClientRewrite<'_> {
    fn visit_data(&mut self, data: &mut DataSpec, scope: &Scope) -> Result<()> {
        let var = Variable::data(data.name.clone()).scoped(scope.clone());
        let Some(idx) = self.graph.get(&var).filter(|i| self.server.contains(i)) else {
            return Ok(());
        };
        match self.support[idx.0] {
            Support::Full => {
                data.clear_definition();
                self.moved.insert(var);
            }
            Support::Partial(k) => {
                let server_name = format!("{SERVER_DATASET_PREFIX}{}", data.name);
                data.source = Some(OneOrMany::One(server_name));
                data.url = None;
                data.values = None;
                data.format = None;
                data.transform.drain(..k);
                self.partial.push(var);
            }
            _ => {}
        }
        Ok(())
    }

    fn visit_signal(&mut self, signal: &mut SignalSpec, scope: &Scope) -> Result<()> {
        if !signal.is_definition() {
            return Ok(());
        }
        let var = Variable::signal(signal.name.clone()).scoped(scope.clone());
        let Some(idx) = self.graph.get(&var).filter(|i| self.server.contains(i)) else {
            return Ok(());
        };
        if self.support[idx.0] == Support::Full {
            signal.update = None;
            signal.init = None;
            self.moved.insert(var);
        }
        Ok(())
    }
}
