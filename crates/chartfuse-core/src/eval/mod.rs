//! Dependency-driven evaluation of a [`TaskGraph`].
//!
//! A node starts once all of its inputs have values. Signal and dataset
//! nodes go through the [`ValueCache`] under their fingerprint, so
//! identical work is shared across requests and sessions. A semaphore
//! bounds how many node computations run at once.

mod dataset;

use std::collections::HashMap;
use std::sync::Arc;

use chartfuse_data::{Connection, Table};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{info_span, Instrument};

use crate::cache::ValueCache;
use crate::error::{ChartError, Result};
use crate::expr::ExprEnv;
use crate::graph::{NodeIndex, NodeKind, Task, TaskGraph};
use crate::metrics::METRICS;
use crate::value::{NodeValue, TaskValue};

/// Per-request inputs that are not part of the graph.
#[derive(Debug, Clone, Default)]
pub struct EvalSettings {
    pub inline: HashMap<String, Table>,
    pub local_tz: String,
    pub default_input_tz: String,
}

#[derive(Clone)]
pub struct Evaluator {
    connection: Arc<dyn Connection>,
    cache: ValueCache,
    permits: Arc<Semaphore>,
}

impl Evaluator {
    pub fn new(connection: Arc<dyn Connection>, cache: ValueCache, worker_threads: usize) -> Self {
        Self {
            connection,
            cache,
            permits: Arc::new(Semaphore::new(worker_threads.max(1))),
        }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    /// Values for `targets` and everything they read.
    ///
    /// `seed` holds values already known (from an earlier pass); those
    /// nodes are not recomputed. `fingerprints` is indexed like the graph.
    pub async fn evaluate(
        &self,
        graph: &Arc<TaskGraph>,
        fingerprints: &Arc<Vec<String>>,
        settings: &Arc<EvalSettings>,
        targets: &[NodeIndex],
        seed: HashMap<NodeIndex, NodeValue>,
    ) -> Result<HashMap<NodeIndex, NodeValue>> {
        let needed = graph.ancestors(targets.iter().copied());
        let dependents = graph.dependents();
        let mut values = seed;

        let mut waiting: HashMap<NodeIndex, usize> = needed
            .iter()
            .filter(|idx| !values.contains_key(idx))
            .map(|&idx| {
                let open = graph
                    .node(idx)
                    .inputs
                    .iter()
                    .filter(|input| !values.contains_key(input))
                    .count();
                (idx, open)
            })
            .collect();
        let mut ready: Vec<NodeIndex> = waiting
            .iter()
            .filter(|(_, open)| **open == 0)
            .map(|(idx, _)| *idx)
            .collect();
        ready.sort();

        let mut running = FuturesUnordered::new();
        loop {
            for idx in ready.drain(..) {
                waiting.remove(&idx);
                let inputs = graph
                    .node(idx)
                    .inputs
                    .iter()
                    .map(|input| values.get(input).cloned().map(|v| (*input, v)))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        ChartError::internal(format!("inputs of {idx} were scheduled unresolved"))
                    })?;
                running.push(self.eval_node(graph, fingerprints, settings, idx, inputs));
            }

            let Some((idx, result)) = running.next().await else {
                break;
            };
            values.insert(idx, result?);
            for dep in &dependents[idx.0] {
                if let Some(open) = waiting.get_mut(dep) {
                    *open -= 1;
                    if *open == 0 {
                        ready.push(*dep);
                    }
                }
            }
        }

        if !waiting.is_empty() {
            return Err(ChartError::internal(format!(
                "{} nodes never became ready",
                waiting.len()
            )));
        }
        Ok(values)
    }

    fn eval_node(
        &self,
        graph: &Arc<TaskGraph>,
        fingerprints: &Arc<Vec<String>>,
        settings: &Arc<EvalSettings>,
        idx: NodeIndex,
        inputs: Vec<(NodeIndex, NodeValue)>,
    ) -> impl std::future::Future<Output = (NodeIndex, Result<NodeValue>)> + Send + 'static {
        let this = self.clone();
        let graph = Arc::clone(graph);
        let settings = Arc::clone(settings);
        let fingerprint = fingerprints.get(idx.0).cloned().unwrap_or_default();
        let node = graph.node(idx);
        let span = info_span!(
            "eval_node",
            node = %node.variable,
            kind = ?node.kind,
            fingerprint = %fingerprint,
        );

        async move {
            let node = graph.node(idx);
            let result = match &node.task {
                Task::Value(value) => Ok(NodeValue::scalar(value.clone())),
                Task::TransformOutput { index } => inputs
                    .first()
                    .and_then(|(_, parent)| parent.outputs.get(*index))
                    .map(|v| NodeValue {
                        value: v.clone(),
                        outputs: Vec::new(),
                        warnings: Vec::new(),
                    })
                    .ok_or_else(|| {
                        ChartError::internal(format!("{} has no transform output {index}", node.variable))
                    }),
                Task::Client => Err(ChartError::internal(format!(
                    "{} can only be evaluated by the client",
                    node.variable
                ))),
                Task::Signal(_) | Task::Dataset(_) => {
                    // held by the shared computation, not by its waiters
                    let permits = Arc::clone(&this.permits);
                    let job = compute(
                        Arc::clone(&graph),
                        idx,
                        inputs,
                        Arc::clone(&this.connection),
                        settings,
                    );
                    let job = async move {
                        let _permit = permits.acquire_owned().await.map_err(|e| {
                            ChartError::internal(format!("worker pool closed: {e}"))
                        })?;
                        job.await
                    };
                    this.cache.insert_or_join(&fingerprint, job).await
                }
            };
            (idx, result)
        }
        .instrument(span)
    }
}

/// The uncached computation of one signal or dataset node.
async fn compute(
    graph: Arc<TaskGraph>,
    idx: NodeIndex,
    inputs: Vec<(NodeIndex, NodeValue)>,
    connection: Arc<dyn Connection>,
    settings: Arc<EvalSettings>,
) -> Result<NodeValue> {
    METRICS.inc_node_evaluations();
    let node = graph.node(idx);

    let mut signals: HashMap<String, Value> = HashMap::new();
    let mut datasets: HashMap<String, Table> = HashMap::new();
    let mut parent = None;
    for (i, (input, value)) in inputs.into_iter().enumerate() {
        let input = graph.node(input);
        match (input.kind, value.value) {
            (NodeKind::Dataset, TaskValue::Table(table)) => {
                if i == 0 {
                    parent = Some(table.clone());
                }
                datasets.insert(input.name().to_string(), table);
            }
            (_, TaskValue::Scalar(v)) => {
                signals.insert(input.name().to_string(), v);
            }
            (_, TaskValue::Table(_)) => {
                return Err(ChartError::internal(format!(
                    "{} produced a table for a signal",
                    input.variable
                )))
            }
        }
    }

    match &node.task {
        Task::Signal(expr) => {
            let env = ExprEnv {
                signals: &signals,
                datasets: &datasets,
                local_tz: &settings.local_tz,
                default_input_tz: &settings.default_input_tz,
            };
            expr.eval(&env).map(NodeValue::scalar)
        }
        Task::Dataset(task) => {
            dataset::evaluate(
                node.name(),
                task,
                signals,
                datasets,
                parent,
                &connection,
                &settings,
            )
            .await
        }
        _ => Err(ChartError::internal(format!(
            "{} is not a computed node",
            node.variable
        ))),
    }
}
