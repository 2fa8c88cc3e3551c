//! Split a chart spec into a server half and a client half.
//!
//! The server half holds everything that can be evaluated ahead of time
//! without breaking interaction; the client half keeps the rest and reads
//! server results through inlined stubs. The [`CommPlan`] lists what has to
//! cross between them.

mod extract;
mod stitch;
mod support;

pub use extract::SERVER_DATASET_PREFIX;
pub use stitch::CommPlan;
pub use support::{classify, Support};

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::graph::{build_graph, Namespace, ScopedVariable, Task};
use crate::spec::ChartSpec;
use crate::warning::{extend_unique, Warning};

#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Let server nodes read values the client changes, reporting each
    /// change back to the server.
    pub allow_client_to_server_comms: bool,
    /// The plan drives a live session that forwards client changes.
    pub live_session: bool,
    /// Signals to evaluate on the server and send even if the client
    /// never reads them.
    pub keep_signals: Vec<ScopedVariable>,
    pub keep_datasets: Vec<ScopedVariable>,
    /// Connection tables that plain `url` sources may name.
    pub server_tables: BTreeSet<String>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            allow_client_to_server_comms: true,
            live_session: false,
            keep_signals: Vec::new(),
            keep_datasets: Vec::new(),
            server_tables: BTreeSet::new(),
        }
    }
}

impl PlannerConfig {
    /// One-shot transforms: with interactivity preserved nothing the client
    /// changes is read by the server.
    pub fn pre_transform(preserve_interactivity: bool) -> Self {
        Self {
            allow_client_to_server_comms: !preserve_interactivity,
            ..Self::default()
        }
    }

    /// Live sessions forward every client change, so nothing breaks.
    pub fn chart_state() -> Self {
        Self {
            allow_client_to_server_comms: true,
            live_session: true,
            ..Self::default()
        }
    }

    fn keep(&self) -> Vec<ScopedVariable> {
        self.keep_signals
            .iter()
            .chain(&self.keep_datasets)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpecPlan {
    pub server_spec: ChartSpec,
    pub client_spec: ChartSpec,
    pub comm_plan: CommPlan,
    pub warnings: Vec<Warning>,
}

impl SpecPlan {
    pub fn try_new(spec: &ChartSpec, config: &PlannerConfig) -> Result<Self> {
        let graph = build_graph(spec)?;
        let support = classify(spec, &graph, config)?;
        let extraction = extract::extract(spec, &graph, &support, config)?;

        let mut server_spec = extraction.server_spec;
        let mut client_spec = extraction.client_spec;
        let comm_plan = stitch::stitch(&mut server_spec, &mut client_spec, &config.keep())?;

        // moved definitions the client never reads
        let sent: BTreeSet<&ScopedVariable> = comm_plan.server_to_client.iter().collect();
        for var in extraction.moved.iter().filter(|v| !sent.contains(v)) {
            let (signals, data) = client_spec.lists_mut(&var.scope)?;
            match var.namespace() {
                Namespace::Signal => signals.retain(|s| s.name != var.name()),
                Namespace::Data => data.retain(|d| d.name != var.name()),
            }
        }

        let mut warnings = Vec::new();
        let mut any_server = false;
        let mut any_computed = false;
        for idx in graph.indices() {
            let node = graph.node(idx);
            let Task::Dataset(task) = &node.task else {
                continue;
            };
            let class = support[idx.0];
            match class {
                Support::Full => any_server = true,
                Support::Partial(_) => {
                    any_server = true;
                    extend_unique(&mut warnings, [Warning::partially_supported(node.name())]);
                }
                Support::Unsupported if task.transforms.iter().any(|tx| !tx.is_supported()) => {
                    extend_unique(&mut warnings, [Warning::partially_supported(node.name())]);
                }
                _ => {}
            }
            if !matches!(class, Support::Mirrored) {
                any_computed = true;
            }
        }
        if !any_server && any_computed {
            warnings.push(Warning::nothing_pre_evaluated());
        }
        if !config.live_session {
            for var in &comm_plan.client_to_server {
                warnings.push(Warning::broken_interactivity(var));
            }
        }

        debug!(
            server_to_client = comm_plan.server_to_client.len(),
            client_to_server = comm_plan.client_to_server.len(),
            partial = extraction.partial.len(),
            "planned spec"
        );
        Ok(Self {
            server_spec,
            client_spec,
            comm_plan,
            warnings,
        })
    }
}
